// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Kernel-shim planner: decides which modules participate via HymoFS and
// emits the add/merge/hide rule stream the kernel control plane consumes.
// Grounded in the original implementation's `core/planner.cpp`, rewired
// onto `crate::kernel::HymoClient` instead of a bespoke ioctl dispatch.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use log::{info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::inventory::{Module, RuleMode};
use crate::kernel::{HymoClient, HymoFsStatus};
use crate::utils;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MountPlan {
    pub hymofs_module_ids: Vec<String>,
}

#[derive(Debug)]
struct AddRule {
    virtual_path: String,
    backing_path: PathBuf,
    dirent_type: i32,
}

#[derive(Debug)]
struct MergeRule {
    virtual_path: String,
    backing_path: PathBuf,
}

fn has_files(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut it| it.next().is_some()).unwrap_or(false)
}

fn has_meaningful_content(module_content: &Path, target_partitions: &[String]) -> bool {
    target_partitions
        .iter()
        .map(|part| module_content.join(part))
        .any(|p| utils::is_dir(&p) && has_files(&p))
}

/// Walks ancestors bottom-up until one exists, canonicalises it, then
/// re-appends the non-existing tail and filename verbatim. Used so a
/// backing path survives even when a parent directory is itself a
/// symlink (e.g. `/sdcard` -> `/storage/emulated/0`), while reporting a
/// path under the symlink's target rather than through it. Falls back
/// to the input unchanged on any resolution failure.
pub fn resolve_path_for_hymofs(path_str: &str) -> String {
    let p = Path::new(path_str);
    let Some(parent) = p.parent() else { return path_str.to_string() };
    let Some(filename) = p.file_name() else { return path_str.to_string() };

    let mut curr = parent.to_path_buf();
    let mut suffix: Vec<PathBuf> = Vec::new();

    while curr != Path::new("/") && !utils::path_exists(&curr) {
        let Some(name) = curr.file_name() else { break };
        suffix.push(PathBuf::from(name));
        let Some(next) = curr.parent() else { break };
        curr = next.to_path_buf();
    }

    if utils::path_exists(&curr) {
        curr = match curr.canonicalize() {
            Ok(c) => c,
            Err(_) => return path_str.to_string(),
        };
    }

    for part in suffix.into_iter().rev() {
        curr.push(part);
    }
    curr.push(filename);
    curr.to_string_lossy().into_owned()
}

/// Whether the kernel-shim backend should be used at all: HymoFS must be
/// reachable, or the caller opted to tolerate a version skew.
fn use_hymofs(status: HymoFsStatus, ignore_protocol_mismatch: bool) -> bool {
    match status {
        HymoFsStatus::Available => true,
        HymoFsStatus::KernelTooOld | HymoFsStatus::ModuleTooOld => ignore_protocol_mismatch,
        HymoFsStatus::NotPresent => false,
    }
}

fn virtual_path_of(mod_path: &Path, entry_path: &Path) -> Option<String> {
    let rel = entry_path.strip_prefix(mod_path).ok()?;
    Some(format!("/{}", rel.to_string_lossy()))
}

/// Joins a virtual (`/`-rooted) path onto `base_root`, so the merge-rule
/// and symlink-safety checks below can be driven against a fake root in
/// tests instead of the live `/`.
fn under_base(base_root: &Path, virtual_path: &str) -> PathBuf {
    base_root.join(virtual_path.trim_start_matches('/'))
}

/// Decides which modules participate in the HymoFS plan (testable
/// property 1). A module with no rules participates whenever its
/// normalised default mode isn't `none`. A module with rules must have
/// at least one file resolving to `hymofs` under a target partition to
/// participate — a rules file that only ever says `hide` or `none`
/// keeps the module out of `hymofs_module_ids` entirely.
pub fn build_plan(config: &Config, modules: &[Module]) -> MountPlan {
    let status = HymoClient::check_status();
    if !use_hymofs(status, config.ignore_protocol_mismatch) {
        info!("HymoFS not usable (status={status:?}), plan is empty");
        return MountPlan::default();
    }
    build_plan_for_status(config, modules, status)
}

/// The participation pass itself, parameterised on an already-resolved
/// `HymoFsStatus` so it can be exercised in tests without touching the
/// process-wide kernel-client singleton (which is always `NotPresent` on
/// a test host with no kernel shim).
fn build_plan_for_status(config: &Config, modules: &[Module], status: HymoFsStatus) -> MountPlan {
    let mut plan = MountPlan::default();
    if !use_hymofs(status, config.ignore_protocol_mismatch) {
        return plan;
    }

    let target_partitions = config.target_partitions();

    for module in modules {
        let mod_path = config.storage_root.join(&module.id);
        if !utils::path_exists(&mod_path) {
            continue;
        }
        if !has_meaningful_content(&mod_path, &target_partitions) {
            continue;
        }

        if module.rules.is_empty() {
            if module.normalised_default_mode() == "none" {
                continue;
            }
            plan.hymofs_module_ids.push(module.id.clone());
            continue;
        }

        let mut hymofs_active = false;
        'partitions: for part in &target_partitions {
            let part_root = mod_path.join(part);
            if !utils::path_exists(&part_root) {
                continue;
            }
            for entry in WalkDir::new(&part_root).min_depth(1) {
                let Ok(entry) = entry else { continue };
                let Some(virtual_path) = virtual_path_of(&mod_path, entry.path()) else { continue };
                if module.resolve_mode(&virtual_path) == RuleMode::HymoFs {
                    hymofs_active = true;
                    break 'partitions;
                }
            }
        }

        if hymofs_active {
            plan.hymofs_module_ids.push(module.id.clone());
        }
    }

    plan
}

/// Collects every `hide`-mode rule declared by a participating module's
/// `hymo_rules.conf`, independent of emission order.
fn collect_explicit_hide_rules(modules: &[Module], plan: &MountPlan) -> Vec<String> {
    let mut hide_rules = Vec::new();
    for module in modules {
        if !plan.hymofs_module_ids.contains(&module.id) {
            continue;
        }
        for rule in &module.rules {
            if rule.mode == RuleMode::Hide {
                hide_rules.push(resolve_path_for_hymofs(&rule.path));
            }
        }
    }
    hide_rules
}

/// Leaf dirent type for `add_rule`, mirroring the wire protocol's
/// `DT_*` constants. Directories never reach here: merge rules cover
/// them, or recursion continues past them.
fn dirent_type_of(file_type: std::fs::FileType) -> i32 {
    let t = if file_type.is_file() {
        libc::DT_REG
    } else if file_type.is_symlink() {
        libc::DT_LNK
    } else if file_type.is_block_device() {
        libc::DT_BLK
    } else if file_type.is_char_device() {
        libc::DT_CHR
    } else if file_type.is_fifo() {
        libc::DT_FIFO
    } else if file_type.is_socket() {
        libc::DT_SOCK
    } else {
        libc::DT_UNKNOWN
    };
    t as i32
}

/// Walks a single module's physical tree under one target partition,
/// appending add/merge/hide rules in place. A directory that already
/// exists as a directory on the base filesystem becomes a merge rule
/// and prunes recursion (`skip_current_dir`) so its children aren't
/// double-emitted; any other directory is skipped but still recursed
/// into, since `add_rules` only ever cover leaves.
fn scan_module_partition(
    module: &Module,
    mod_path: &Path,
    part_root: &Path,
    base_root: &Path,
    add_rules: &mut Vec<AddRule>,
    merge_rules: &mut Vec<MergeRule>,
    hide_rules: &mut Vec<String>,
) {
    let mut walker = WalkDir::new(part_root).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("error scanning module {}: {e}", module.id);
                continue;
            }
        };

        let Some(virtual_path) = virtual_path_of(mod_path, entry.path()) else { continue };
        if module.resolve_mode(&virtual_path) != RuleMode::HymoFs {
            continue;
        }

        let file_type = entry.file_type();
        let final_virtual = resolve_path_for_hymofs(&virtual_path);

        if file_type.is_dir() {
            let final_path = under_base(base_root, &final_virtual);
            if utils::path_exists(&final_path) && utils::is_dir(&final_path) {
                merge_rules.push(MergeRule {
                    virtual_path: final_virtual,
                    backing_path: entry.path().to_path_buf(),
                });
                walker.skip_current_dir();
            }
            continue;
        }

        if file_type.is_symlink() {
            let vpath = under_base(base_root, &virtual_path);
            if utils::path_exists(&vpath) && utils::is_dir(&vpath) {
                warn!("safety: skipping symlink replacement for directory: {virtual_path}");
                continue;
            }
            add_rules.push(AddRule {
                virtual_path: final_virtual,
                backing_path: entry.path().to_path_buf(),
                dirent_type: libc::DT_LNK as i32,
            });
            continue;
        }

        let Ok(metadata) = entry.metadata() else { continue };
        if utils::fs::is_whiteout(&metadata) {
            hide_rules.push(final_virtual);
            continue;
        }

        add_rules.push(AddRule {
            virtual_path: final_virtual,
            backing_path: entry.path().to_path_buf(),
            dirent_type: dirent_type_of(file_type),
        });
    }
}

/// Builds the full rule stream for every participating module, iterated
/// in reverse inventory order (lowest priority first) so a later
/// `add_rule`/`add_merge_rule` call for the same virtual path — issued
/// by a higher-priority module — overrides an earlier one in the
/// kernel's last-write-wins rule table.
fn build_rule_stream(
    config: &Config,
    modules: &[Module],
    plan: &MountPlan,
    base_root: &Path,
) -> (Vec<AddRule>, Vec<MergeRule>, Vec<String>) {
    let mut add_rules = Vec::new();
    let mut merge_rules = Vec::new();
    let mut hide_rules = collect_explicit_hide_rules(modules, plan);

    let target_partitions = config.target_partitions();

    for module in modules.iter().rev() {
        if !plan.hymofs_module_ids.contains(&module.id) {
            continue;
        }
        let mod_path = config.storage_root.join(&module.id);
        for part in &target_partitions {
            let part_root = mod_path.join(part);
            if !utils::path_exists(&part_root) {
                continue;
            }
            scan_module_partition(module, &mod_path, &part_root, base_root, &mut add_rules, &mut merge_rules, &mut hide_rules);
        }
    }

    (add_rules, merge_rules, hide_rules)
}

/// Pushes the rule stream through the kernel client in the mandated
/// order: clear, then every add, then every merge, then every hide,
/// then user hide rules, then enable. Idempotent under partial failure:
/// a single rejected rule is logged and skipped, the rest still apply.
fn apply(add_rules: Vec<AddRule>, merge_rules: Vec<MergeRule>, hide_rules: Vec<String>) {
    HymoClient::clear_rules();

    for rule in &add_rules {
        if !HymoClient::add_rule(&rule.virtual_path, &rule.backing_path.to_string_lossy(), rule.dirent_type) {
            warn!("add_rule failed: {} -> {}", rule.virtual_path, rule.backing_path.display());
        }
    }
    for rule in &merge_rules {
        if !HymoClient::add_merge_rule(&rule.virtual_path, &rule.backing_path.to_string_lossy()) {
            warn!("add_merge_rule failed: {} -> {}", rule.virtual_path, rule.backing_path.display());
        }
    }
    for path in &hide_rules {
        if !HymoClient::hide_path(path) {
            warn!("hide_path failed: {path}");
        }
    }

    crate::user_rules::apply_all();
    HymoClient::set_enabled(true);

    info!(
        "HymoFS mappings updated: {} adds, {} merges, {} hides",
        add_rules.len(),
        merge_rules.len(),
        hide_rules.len()
    );
}

/// Top-level orchestration: builds the participation plan, and if it's
/// non-empty, builds and pushes the rule stream. An empty plan sends no
/// mutating command at all (scenario: kernel missing or no module
/// participates).
pub fn run(config: &Config, modules: &[Module]) -> MountPlan {
    let plan = build_plan(config, modules);
    if plan.hymofs_module_ids.is_empty() {
        info!("HymoFS plan is empty, nothing to push");
        return plan;
    }

    let (add_rules, merge_rules, hide_rules) = build_rule_stream(config, modules, &plan, Path::new("/"));
    apply(add_rules, merge_rules, hide_rules);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ModuleRule;
    use std::fs;

    fn module(id: &str, mode: &str, rules: Vec<ModuleRule>) -> Module {
        Module { id: id.to_string(), source_path: PathBuf::new(), mode: mode.to_string(), rules }
    }

    #[test]
    fn resolve_path_keeps_existing_absolute_path_unchanged() {
        assert_eq!(resolve_path_for_hymofs("/"), "/");
    }

    #[test]
    fn resolve_path_reappends_nonexisting_tail_under_canonical_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let input = real.join("missing_child").join("leaf.txt");
        let resolved = resolve_path_for_hymofs(&input.to_string_lossy());
        assert_eq!(Path::new(&resolved), input);
    }

    #[test]
    fn build_plan_is_empty_when_kernel_not_present() {
        HymoClient::reset_for_test();
        let dir = tempfile::tempdir().unwrap();
        let content = dir.path().join("10_mod").join("system").join("bin");
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join("busybox"), b"x").unwrap();

        let mut config = Config::default();
        config.storage_root = dir.path().to_path_buf();
        let modules = vec![module("10_mod", "auto", Vec::new())];

        let plan = build_plan(&config, &modules);
        assert!(plan.hymofs_module_ids.is_empty());
    }

    /// Testable property 1: a module with no rules file, default mode
    /// `auto`, and at least one file under a target partition is
    /// included in `hymofs_module_ids` once the kernel is available.
    #[test]
    fn module_with_no_rules_and_content_participates_when_available() {
        let dir = tempfile::tempdir().unwrap();
        let content = dir.path().join("10_mod").join("system").join("bin");
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join("busybox"), b"x").unwrap();

        let mut config = Config::default();
        config.storage_root = dir.path().to_path_buf();
        let modules = vec![module("10_mod", "auto", Vec::new())];

        let plan = build_plan_for_status(&config, &modules, HymoFsStatus::Available);
        assert_eq!(plan.hymofs_module_ids, vec!["10_mod".to_string()]);
    }

    #[test]
    fn module_with_mode_none_and_no_rules_does_not_participate() {
        let dir = tempfile::tempdir().unwrap();
        let content = dir.path().join("10_mod").join("system").join("bin");
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join("busybox"), b"x").unwrap();

        let mut config = Config::default();
        config.storage_root = dir.path().to_path_buf();
        let modules = vec![module("10_mod", "none", Vec::new())];

        let plan = build_plan_for_status(&config, &modules, HymoFsStatus::Available);
        assert!(plan.hymofs_module_ids.is_empty());
    }

    /// A module whose only rule hides a sub-path still participates
    /// (scenario S3): the default mode is not `none`, and files outside
    /// the hidden prefix still resolve to `hymofs`.
    #[test]
    fn module_with_hide_subpath_rule_still_participates() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("10_mod").join("system").join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("tool"), b"x").unwrap();

        let mut config = Config::default();
        config.storage_root = dir.path().to_path_buf();
        let modules = vec![module(
            "10_mod",
            "auto",
            vec![ModuleRule { path: "/system/lib/debug".to_string(), mode: RuleMode::Hide }],
        )];

        let plan = build_plan_for_status(&config, &modules, HymoFsStatus::Available);
        assert_eq!(plan.hymofs_module_ids, vec!["10_mod".to_string()]);
    }

    /// A module whose rules resolve every entry to `hide`/`none` never
    /// participates, even with content present.
    #[test]
    fn module_with_only_hide_rules_covering_all_content_does_not_participate() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("10_mod").join("system").join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("tool"), b"x").unwrap();

        let mut config = Config::default();
        config.storage_root = dir.path().to_path_buf();
        let modules = vec![module(
            "10_mod",
            "none",
            vec![ModuleRule { path: "/system".to_string(), mode: RuleMode::Hide }],
        )];

        let plan = build_plan_for_status(&config, &modules, HymoFsStatus::Available);
        assert!(plan.hymofs_module_ids.is_empty());
    }

    /// Testable property 3 / scenario S2: two modules ship the same
    /// virtual path; the reverse-order walk must emit the
    /// lower-priority (lexicographically smaller id) module's rule
    /// first, so the higher-priority module's rule lands last and wins
    /// under the kernel's last-write-wins semantics.
    #[test]
    fn same_path_conflict_emits_lower_priority_rule_first() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["99_a", "10_b"] {
            let bin = dir.path().join(id).join("system").join("bin");
            fs::create_dir_all(&bin).unwrap();
            fs::write(bin.join("tool"), id.as_bytes()).unwrap();
        }

        let mut config = Config::default();
        config.storage_root = dir.path().to_path_buf();
        // Inventory order is descending by id, matching scan_modules.
        let modules = vec![module("99_a", "auto", Vec::new()), module("10_b", "auto", Vec::new())];
        let plan = MountPlan { hymofs_module_ids: vec!["99_a".to_string(), "10_b".to_string()] };

        let (add_rules, _, _) = build_rule_stream(&config, &modules, &plan, Path::new("/"));
        let backers: Vec<_> = add_rules
            .iter()
            .filter(|r| r.virtual_path == "/system/bin/tool")
            .map(|r| r.backing_path.clone())
            .collect();
        assert_eq!(backers.len(), 2);
        assert!(backers[0].starts_with(dir.path().join("10_b")), "lower priority emitted first");
        assert!(backers[1].starts_with(dir.path().join("99_a")), "higher priority emitted last, wins");
    }

    /// Scenario S5: a whiteout entry (char device, rdev 0) yields a
    /// hide rule and no add rule.
    #[test]
    fn whiteout_entry_emits_hide_rule_only() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("10_mod").join("system").join("bin");
        fs::create_dir_all(&bin).unwrap();
        let whiteout = bin.join("badapp");
        let c_path = std::ffi::CString::new(whiteout.to_string_lossy().as_bytes()).unwrap();
        let ret = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR, 0) };
        if ret != 0 {
            // mknod requires CAP_MKNOD; skip on hosts without it rather
            // than fail the suite.
            return;
        }

        let mut config = Config::default();
        config.storage_root = dir.path().to_path_buf();
        let modules = vec![module("10_mod", "auto", Vec::new())];
        let plan = MountPlan { hymofs_module_ids: vec!["10_mod".to_string()] };

        let (add_rules, _, hide_rules) = build_rule_stream(&config, &modules, &plan, Path::new("/"));
        assert_eq!(hide_rules, vec!["/system/bin/badapp".to_string()]);
        assert!(add_rules.is_empty());
    }

    #[test]
    fn no_rules_module_skips_when_mode_is_none() {
        let none_module = module("10_mod", "none", Vec::new());
        assert_eq!(none_module.normalised_default_mode(), "none");
    }

    #[test]
    fn hide_only_rules_do_not_resolve_to_hymofs() {
        let m = module(
            "10_mod",
            "auto",
            vec![ModuleRule { path: "/system/bin".to_string(), mode: RuleMode::Hide }],
        );
        assert_eq!(m.resolve_mode("/system/bin/app"), RuleMode::Hide);
    }

    #[test]
    fn dirent_type_picks_reg_for_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        let ft = fs::metadata(&file).unwrap().file_type();
        assert_eq!(dirent_type_of(ft), libc::DT_REG as i32);
    }

    #[test]
    fn merge_rule_emitted_only_when_virtual_dir_exists_on_base() {
        let dir = tempfile::tempdir().unwrap();
        let mod_root = dir.path().join("10_mod");
        let part = mod_root.join("system").join("lib");
        fs::create_dir_all(&part).unwrap();
        fs::write(part.join("libfoo.so"), b"x").unwrap();

        let m = module("10_mod", "auto", Vec::new());
        let mut add_rules = Vec::new();
        let mut merge_rules = Vec::new();
        let mut hide_rules = Vec::new();
        let fake_base = dir.path().join("fake_root");
        fs::create_dir_all(&fake_base).unwrap();

        // /system/lib does not exist under the fake base, so the
        // directory itself yields no merge rule, but its child still
        // becomes an add rule: recursion continues past a non-matching
        // directory.
        scan_module_partition(&m, &mod_root, &mod_root.join("system"), &fake_base, &mut add_rules, &mut merge_rules, &mut hide_rules);

        assert!(merge_rules.is_empty());
        assert_eq!(add_rules.len(), 1);
        assert_eq!(add_rules[0].virtual_path, "/system/lib/libfoo.so");
    }

    #[test]
    fn merge_rule_emitted_when_virtual_dir_exists_under_base_root() {
        let dir = tempfile::tempdir().unwrap();
        let mod_root = dir.path().join("10_mod");
        let part = mod_root.join("system").join("lib");
        fs::create_dir_all(&part).unwrap();
        fs::write(part.join("libfoo.so"), b"x").unwrap();

        let fake_base = dir.path().join("fake_root");
        fs::create_dir_all(fake_base.join("system").join("lib")).unwrap();

        let m = module("10_mod", "auto", Vec::new());
        let mut add_rules = Vec::new();
        let mut merge_rules = Vec::new();
        let mut hide_rules = Vec::new();
        scan_module_partition(&m, &mod_root, &mod_root.join("system"), &fake_base, &mut add_rules, &mut merge_rules, &mut hide_rules);

        assert_eq!(merge_rules.len(), 1);
        assert_eq!(merge_rules[0].virtual_path, "/system/lib");
        assert!(add_rules.is_empty(), "recursion must stop once a merge rule is emitted");
    }

    #[test]
    fn symlink_over_existing_directory_is_skipped_for_safety() {
        let dir = tempfile::tempdir().unwrap();
        let mod_root = dir.path().join("10_mod");
        let part = mod_root.join("system");
        fs::create_dir_all(&part).unwrap();
        std::os::unix::fs::symlink("/tmp", part.join("tmp")).unwrap();

        let fake_base = dir.path().join("fake_root");
        fs::create_dir_all(fake_base.join("system").join("tmp")).unwrap();

        let m = module("10_mod", "auto", Vec::new());
        let mut add_rules = Vec::new();
        let mut merge_rules = Vec::new();
        let mut hide_rules = Vec::new();
        scan_module_partition(&m, &mod_root, &part, &fake_base, &mut add_rules, &mut merge_rules, &mut hide_rules);

        assert!(add_rules.is_empty());
        assert!(merge_rules.is_empty());
    }
}
