// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later
//
// The in-memory union tree the magic-mount planner builds before
// realising it with bind mounts. Grounded in the bind-mount union
// planner found in the sibling `trangkyanh17-meta-hybrid_mount` example
// (`mount/node.rs`), renamed onto this crate's field names.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::path::PathBuf;

use crate::inventory::Module;
use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
    Whiteout,
}

impl NodeKind {
    fn from_file_type(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            NodeKind::Directory
        } else if ft.is_symlink() {
            NodeKind::Symlink
        } else {
            NodeKind::Regular
        }
    }

    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        if meta.file_type().is_char_device() && utils::fs::is_whiteout(meta) {
            NodeKind::Whiteout
        } else {
            Self::from_file_type(meta.file_type())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub children: HashMap<String, Node>,
    pub module_backing_path: Option<PathBuf>,
    pub owning_module_id: Option<String>,
    pub replace: bool,
    pub skip: bool,
    pub done: bool,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            children: HashMap::new(),
            module_backing_path: None,
            owning_module_id: None,
            replace: false,
            skip: false,
            done: false,
        }
    }

    pub fn new_root() -> Self {
        Self::new("", NodeKind::Directory)
    }
}

/// Recursively merges `dir`'s real contents (belonging to `module_id`)
/// into `parent`'s children. First wins within tree-build order: an
/// already-present node at a given name is never replaced, but its
/// children are still visited so a lower-priority module can fill in
/// entries the higher-priority one never supplied.
fn populate_from_dir(parent: &mut Node, dir: &Path, module_id: &str) {
    let Ok(entries) = fs::read_dir(dir) else { return };

    for entry in entries.flatten() {
        let entry_path = entry.path();
        let Ok(meta) = entry_path.symlink_metadata() else { continue };
        let kind = NodeKind::from_metadata(&meta);
        let name = entry.file_name().to_string_lossy().into_owned();

        let is_new = !parent.children.contains_key(&name);
        if is_new {
            let mut node = Node::new(name.clone(), kind);
            node.module_backing_path = Some(entry_path.clone());
            node.owning_module_id = Some(module_id.to_string());
            if kind == NodeKind::Directory {
                node.replace = utils::is_dir_opaque(&entry_path);
            }
            parent.children.insert(name.clone(), node);
        }

        if kind == NodeKind::Directory
            && let Some(child) = parent.children.get_mut(&name)
            && child.kind == NodeKind::Directory
        {
            populate_from_dir(child, &entry_path, module_id);
        }
    }
}

/// Lifts `vendor`, `product`, `system_ext`, `odm`, plus any caller-extra
/// partitions, out from under the synthetic `system` node to the root —
/// the Android "system-as-root" condition — iff the real root contains
/// that directory (and, for the first three, `/system/<name>` is itself
/// a symlink on the device).
fn lift_partitions(root: &mut Node, extra_partitions: &[String]) {
    const REQUIRES_SYMLINK_CHECK: &[&str] = &["vendor", "product", "system_ext"];

    let mut names: Vec<String> = crate::defs::LIFTABLE_PARTITIONS.iter().map(|s| s.to_string()).collect();
    for part in extra_partitions {
        if part != "system" && !names.contains(part) {
            names.push(part.clone());
        }
    }

    let Some(system) = root.children.get_mut("system") else { return };

    for name in names {
        let root_path = Path::new("/").join(&name);
        if !utils::is_dir(&root_path) {
            continue;
        }
        if REQUIRES_SYMLINK_CHECK.contains(&name.as_str()) {
            let system_link = Path::new("/system").join(&name);
            if !utils::is_symlink(&system_link) {
                continue;
            }
        }
        if let Some(node) = system.children.remove(&name) {
            root.children.insert(name, node);
        }
    }
}

/// Builds the full union tree for every given module, in inventory
/// (priority-descending) order, then performs the system-as-root lift.
pub fn collect_module_files(modules: &[Module], storage_root: &Path, extra_partitions: &[String]) -> Node {
    let mut root = Node::new_root();
    root.children.insert("system".to_string(), Node::new("system", NodeKind::Directory));

    for module in modules {
        let system_src = storage_root.join(&module.id).join("system");
        if !utils::is_dir(&system_src) {
            continue;
        }
        let system = root.children.get_mut("system").expect("system node inserted above");
        populate_from_dir(system, &system_src, &module.id);
    }

    lift_partitions(&mut root, extra_partitions);
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn first_module_wins_at_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let hi = dir.path().join("20_hi").join("system").join("bin");
        let lo = dir.path().join("10_lo").join("system").join("bin");
        fs::create_dir_all(&hi).unwrap();
        fs::create_dir_all(&lo).unwrap();
        fs::write(hi.join("app"), b"hi").unwrap();
        fs::write(lo.join("app"), b"lo").unwrap();
        // Also give the lower-priority module an entry the higher one
        // never provides, to confirm children still get merged in.
        fs::write(lo.join("only_in_lo"), b"lo").unwrap();

        let modules = vec![
            Module { id: "20_hi".to_string(), source_path: PathBuf::new(), mode: "auto".to_string(), rules: Vec::new() },
            Module { id: "10_lo".to_string(), source_path: PathBuf::new(), mode: "auto".to_string(), rules: Vec::new() },
        ];

        let root = collect_module_files(&modules, dir.path(), &[]);
        let bin = &root.children["system"].children["bin"];
        let app = &bin.children["app"];
        assert_eq!(app.owning_module_id.as_deref(), Some("20_hi"));
        assert!(bin.children.contains_key("only_in_lo"));
        assert_eq!(bin.children["only_in_lo"].owning_module_id.as_deref(), Some("10_lo"));
    }

    #[test]
    fn whiteout_detected_via_char_device_zero_rdev() {
        // Covered indirectly: NodeKind::from_metadata depends on
        // crate::utils::fs::is_whiteout, already exercised in utils::fs
        // tests; this just checks the Directory/Regular/Symlink split.
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        let meta = file.symlink_metadata().unwrap();
        assert_eq!(NodeKind::from_metadata(&meta), NodeKind::Regular);
    }
}
