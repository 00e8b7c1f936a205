// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Bind-mount union planner/executor — the fallback path used when the
// HymoFS kernel shim is unavailable. Grounded in the sibling
// `trangkyanh17-meta-hybrid_mount` example's `mount/magic.rs`, rewired
// onto this crate's `Node` field names and `utils::fs` SELinux/xattr
// helpers instead of its bespoke `lgetfilecon`/`lsetfilecon` pair.

use std::fs::{self, DirEntry};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use rustix::fs::{Gid, Mode, Uid, chmod, chown};
use rustix::mount::{MountFlags, MountPropagationFlags, UnmountFlags, mount, mount_bind, mount_change, mount_move, mount_remount, unmount};

use crate::config::Config;
use crate::inventory::Module;
use crate::mount::node::{self, Node, NodeKind};
use crate::state::MagicMountStats;
use crate::utils;

fn clone_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src).with_context(|| format!("read_link {}", src.display()))?;
    std::os::unix::fs::symlink(&target, dst).with_context(|| format!("symlink {}", dst.display()))?;
    utils::copy_selinux_context(src, dst);
    Ok(())
}

/// Mirrors an untouched real-filesystem child (one the union tree has
/// no node for) into the tmpfs region, so the final directory still
/// looks complete once the real directory is replaced.
fn mount_mirror(path: &Path, work_dir_path: &Path, entry: &DirEntry) -> Result<()> {
    let src = path.join(entry.file_name());
    let dst = work_dir_path.join(entry.file_name());
    let file_type = entry.file_type()?;

    if file_type.is_file() {
        fs::File::create(&dst)?;
        mount_bind(&src, &dst).with_context(|| format!("mirror bind {} -> {}", src.display(), dst.display()))?;
    } else if file_type.is_dir() {
        fs::create_dir(&dst)?;
        let metadata = entry.metadata()?;
        chmod(&dst, Mode::from_raw_mode(metadata.mode()))?;
        chown(&dst, Some(Uid::from_raw(metadata.uid())), Some(Gid::from_raw(metadata.gid())))?;
        utils::copy_selinux_context(&src, &dst);
        for child in fs::read_dir(&src)?.flatten() {
            mount_mirror(&src, &dst, &child)?;
        }
    } else if file_type.is_symlink() {
        clone_symlink(&src, &dst)?;
    }
    Ok(())
}

pub struct Stats {
    pub nodes_mounted: u32,
    pub nodes_skipped: u32,
    pub nodes_whiteout: u32,
    pub nodes_fail: u32,
}

impl Stats {
    fn new() -> Self {
        Self { nodes_mounted: 0, nodes_skipped: 0, nodes_whiteout: 0, nodes_fail: 0 }
    }
}

struct MagicMount<'a> {
    node: Node,
    path: PathBuf,
    work_dir_path: PathBuf,
    has_tmpfs: bool,
    stats: &'a mut Stats,
}

impl<'a> MagicMount<'a> {
    fn new(node: &Node, path: &Path, work_dir_path: &Path, has_tmpfs: bool, stats: &'a mut Stats) -> Self {
        Self {
            node: node.clone(),
            path: path.join(&node.name),
            work_dir_path: work_dir_path.join(&node.name),
            has_tmpfs,
            stats,
        }
    }

    fn do_magic_mount(&mut self) -> Result<()> {
        match self.node.kind {
            NodeKind::Regular => self.handle_regular(),
            NodeKind::Symlink => self.handle_symlink(),
            NodeKind::Directory => self.handle_directory(),
            NodeKind::Whiteout => {
                log::debug!("file {} is removed", self.path.display());
                self.stats.nodes_whiteout += 1;
                Ok(())
            }
        }
    }

    fn handle_regular(&mut self) -> Result<()> {
        let target = if self.has_tmpfs {
            fs::File::create(&self.work_dir_path)?;
            &self.work_dir_path
        } else {
            &self.path
        };

        let Some(module_path) = &self.node.module_backing_path else {
            bail!("cannot mount root file {} with no module backing", self.path.display());
        };

        mount_bind(module_path, target).with_context(|| format!("bind {} -> {}", module_path.display(), target.display()))?;
        if let Err(e) = mount_remount(target, MountFlags::RDONLY | MountFlags::BIND, "") {
            warn!("remount {} read-only failed: {e}", target.display());
        }
        self.stats.nodes_mounted += 1;
        Ok(())
    }

    fn handle_symlink(&mut self) -> Result<()> {
        let Some(module_path) = &self.node.module_backing_path else {
            bail!("cannot mount root symlink {} with no module backing", self.path.display());
        };
        clone_symlink(module_path, &self.work_dir_path)?;
        self.stats.nodes_mounted += 1;
        Ok(())
    }

    /// A directory's real-path `lstat` kind disagreeing with the node's
    /// expected kind, a child symlink, or a whiteout whose virtual path
    /// still exists, all force a tmpfs overlay for this directory.
    fn child_needs_tmpfs(real_path: &Path, node: &Node) -> bool {
        match node.kind {
            NodeKind::Symlink => true,
            NodeKind::Whiteout => utils::path_exists(real_path),
            _ => match real_path.symlink_metadata() {
                Ok(meta) => {
                    let actual = if meta.file_type().is_dir() {
                        NodeKind::Directory
                    } else if meta.file_type().is_symlink() {
                        NodeKind::Symlink
                    } else {
                        NodeKind::Regular
                    };
                    actual != node.kind || actual == NodeKind::Symlink
                }
                Err(_) => true,
            },
        }
    }

    fn handle_directory(&mut self) -> Result<()> {
        let mut create_tmpfs = !self.has_tmpfs && self.node.replace && self.node.module_backing_path.is_some();

        if !self.has_tmpfs && !create_tmpfs {
            for (name, child) in self.node.children.iter_mut() {
                let real_path = self.path.join(name);
                if Self::child_needs_tmpfs(&real_path, child) {
                    if child.module_backing_path.is_none() {
                        child.skip = true;
                        continue;
                    }
                    create_tmpfs = true;
                    break;
                }
            }
        }

        let has_tmpfs = self.has_tmpfs || create_tmpfs;

        if has_tmpfs {
            utils::mkdir_recursive(&self.work_dir_path)?;
            let (metadata, context_src) = if self.path.exists() {
                (self.path.metadata()?, self.path.clone())
            } else if let Some(mp) = &self.node.module_backing_path {
                (mp.metadata()?, mp.clone())
            } else {
                bail!("no source to copy directory attributes for {}", self.path.display());
            };
            chmod(&self.work_dir_path, Mode::from_raw_mode(metadata.mode()))?;
            chown(&self.work_dir_path, Some(Uid::from_raw(metadata.uid())), Some(Gid::from_raw(metadata.gid())))?;
            utils::copy_selinux_context(&context_src, &self.work_dir_path);
        }

        if create_tmpfs {
            mount_bind(&self.work_dir_path, &self.work_dir_path).context("self-bind tmpfs directory")?;
        }

        if self.path.exists() && !self.node.replace {
            for entry in self.path.read_dir()?.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(child) = self.node.children.remove(&name) {
                    if !child.skip {
                        MagicMount::new(&child, &self.path, &self.work_dir_path, has_tmpfs, self.stats).do_magic_mount()?;
                    } else {
                        self.stats.nodes_skipped += 1;
                    }
                } else if has_tmpfs {
                    mount_mirror(&self.path, &self.work_dir_path, &entry)?;
                }
            }
        }

        for child in self.node.children.values() {
            if !child.skip {
                MagicMount::new(child, &self.path, &self.work_dir_path, has_tmpfs, self.stats).do_magic_mount()?;
            } else {
                self.stats.nodes_skipped += 1;
            }
        }

        if create_tmpfs {
            mount_remount(&self.work_dir_path, MountFlags::RDONLY | MountFlags::BIND, "").ok();
            mount_move(&self.work_dir_path, &self.path).context("MS_MOVE tmpfs directory onto live path")?;
            mount_change(&self.path, MountPropagationFlags::PRIVATE)?;
        }

        Ok(())
    }
}

/// Top-level entry point: builds the union tree, enters PID 1's mount
/// namespace, realises a scratch tmpfs, executes the tree, then tears
/// the scratch tmpfs down.
pub fn run(config: &Config, modules: &[Module]) -> Result<MagicMountStats> {
    utils::require_root("magic-mount")?;

    let mut result_stats = MagicMountStats { modules_total: modules.len() as u32, ..Default::default() };

    let root = node::collect_module_files(modules, &config.storage_root, &config.partitions);
    if root.children.get("system").map(|s| s.children.is_empty()).unwrap_or(true) && root.children.len() <= 1 {
        info!("magic-mount: no module contributes any file, nothing to mount");
        return Ok(result_stats);
    }

    utils::enter_pid1_mount_ns().context("entering pid 1 mount namespace")?;

    let work_root = config.tempdir.clone().unwrap_or_else(utils::select_tmpfs_dir);
    let tmp_dir = work_root.join("workdir");
    utils::mkdir_recursive(&tmp_dir)?;

    mount(crate::defs::DEFAULT_MOUNT_SOURCE, &tmp_dir, "tmpfs", MountFlags::empty(), None::<&std::ffi::CStr>)
        .context("mount scratch tmpfs")?;
    mount_change(&tmp_dir, MountPropagationFlags::PRIVATE).context("mark scratch tmpfs private")?;

    let mut failed_modules = Vec::new();
    let mut stats = Stats::new();
    let mount_result = MagicMount::new(&root, Path::new("/"), &tmp_dir, false, &mut stats).do_magic_mount();

    if let Err(e) = &mount_result {
        warn!("magic-mount failed: {e:#}");
        stats.nodes_fail += 1;
        failed_modules.push("<root>".to_string());
    }

    let _ = unmount(&tmp_dir, UnmountFlags::DETACH);
    let _ = fs::remove_dir(&tmp_dir);

    result_stats.nodes_total = count_nodes(&root);
    result_stats.nodes_mounted = stats.nodes_mounted;
    result_stats.nodes_skipped = stats.nodes_skipped;
    result_stats.nodes_whiteout = stats.nodes_whiteout;
    result_stats.nodes_fail = stats.nodes_fail;
    result_stats.failed_modules = failed_modules;

    info!(
        "magic-mount: {} modules, {} nodes mounted, {} skipped, {} whiteouts, {} failures",
        result_stats.modules_total,
        result_stats.nodes_mounted,
        result_stats.nodes_skipped,
        result_stats.nodes_whiteout,
        result_stats.nodes_fail
    );

    mount_result?;
    Ok(result_stats)
}

fn count_nodes(node: &Node) -> u32 {
    1 + node.children.values().map(count_nodes).sum::<u32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_needs_tmpfs_for_symlink_node() {
        let n = Node::new("x", NodeKind::Symlink);
        assert!(MagicMount::child_needs_tmpfs(Path::new("/does/not/exist"), &n));
    }

    #[test]
    fn child_needs_tmpfs_false_for_matching_directory() {
        let dir = tempfile::tempdir().unwrap();
        let n = Node::new("x", NodeKind::Directory);
        assert!(!MagicMount::child_needs_tmpfs(dir.path(), &n));
    }

    #[test]
    fn count_nodes_counts_root_and_children() {
        let mut root = Node::new_root();
        root.children.insert("a".to_string(), Node::new("a", NodeKind::Regular));
        root.children.insert("b".to_string(), Node::new("b", NodeKind::Regular));
        assert_eq!(count_nodes(&root), 3);
    }
}
