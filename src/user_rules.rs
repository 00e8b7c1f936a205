// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::defs::USER_HIDE_RULES_FILE;
use crate::kernel::HymoClient;
use crate::utils::is_absolute_path;

pub fn load_rules() -> Vec<String> {
    load_rules_from(Path::new(USER_HIDE_RULES_FILE))
}

fn load_rules_from(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| line.starts_with('/'))
        .map(str::to_string)
        .collect()
}

fn save_rules_to(path: &Path, rules: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create hide-rules directory")?;
    }
    let content = rules.iter().map(|r| format!("{r}\n")).collect::<String>();
    fs::write(path, content).context("failed to write user hide rules file")?;
    info!("saved {} user hide rules", rules.len());
    Ok(())
}

pub fn save_rules(rules: &[String]) -> Result<()> {
    save_rules_to(Path::new(USER_HIDE_RULES_FILE), rules)
}

/// Adds `path` to the store. Duplicates are no-ops. If the kernel shim is
/// available, pushes the rule immediately; a kernel push failure still
/// leaves the file write in place.
pub fn add_rule(path: &str) -> Result<bool> {
    add_rule_to(Path::new(USER_HIDE_RULES_FILE), path)
}

fn add_rule_to(file: &Path, path: &str) -> Result<bool> {
    if !is_absolute_path(path) {
        anyhow::bail!("hide-rule path must be absolute: {path}");
    }

    let mut rules = load_rules_from(file);
    if rules.iter().any(|r| r == path) {
        return Ok(true);
    }
    rules.push(path.to_string());
    save_rules_to(file, &rules)?;

    if HymoClient::is_available() && !HymoClient::hide_path(path) {
        warn!("failed to apply hide rule to kernel (saved to file): {path}");
    }

    Ok(true)
}

/// Removes `path` from the file store only — the kernel cannot
/// distinguish user- from module-origin rules, so its copy persists
/// until the next full reload.
pub fn remove_rule(path: &str) -> Result<bool> {
    remove_rule_from(Path::new(USER_HIDE_RULES_FILE), path)
}

fn remove_rule_from(file: &Path, path: &str) -> Result<bool> {
    let mut rules = load_rules_from(file);
    let before = rules.len();
    rules.retain(|r| r != path);
    if rules.len() == before {
        return Ok(false);
    }
    save_rules_to(file, &rules)?;
    Ok(true)
}

pub fn apply_all() {
    let rules = load_rules();
    if rules.is_empty() {
        return;
    }
    if !HymoClient::is_available() {
        warn!("HymoFS not available, cannot apply user hide rules");
        return;
    }

    let (mut success, mut failed) = (0u32, 0u32);
    for rule in &rules {
        if HymoClient::hide_path(rule) {
            success += 1;
        } else {
            failed += 1;
            warn!("failed to apply user hide rule: {rule}");
        }
    }
    info!("applied user hide rules: {success} success, {failed} failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_add_then_remove_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user_hide_rules");

        add_rule_to(&file, "/system/bin/badapp").unwrap();
        add_rule_to(&file, "/system/bin/badapp").unwrap();
        assert_eq!(load_rules_from(&file).len(), 1);

        remove_rule_from(&file, "/system/bin/badapp").unwrap();
        assert!(load_rules_from(&file).is_empty());
    }

    #[test]
    fn rejects_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user_hide_rules");
        assert!(add_rule_to(&file, "relative/path").is_err());
    }

    #[test]
    fn ignores_blank_and_comment_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user_hide_rules");
        fs::write(&file, "\n# a comment\n/system/bin/foo\n").unwrap();
        assert_eq!(load_rules_from(&file), vec!["/system/bin/foo".to_string()]);
    }
}
