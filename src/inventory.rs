// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::path::{Path, PathBuf};

use log::error;

use crate::defs::{
    DISABLE_FILE_NAME, MODULE_PROP_FILE_NAME, MODULE_RULES_FILE_NAME, REMOVE_FILE_NAME,
    RESERVED_MODULE_IDS, SKIP_MOUNT_FILE_NAME,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMode {
    HymoFs,
    None,
    Hide,
}

impl RuleMode {
    fn parse(s: &str) -> Self {
        match s {
            "hide" => RuleMode::Hide,
            "none" => RuleMode::None,
            _ => RuleMode::HymoFs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleRule {
    pub path: String,
    pub mode: RuleMode,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub id: String,
    pub source_path: PathBuf,
    pub mode: String,
    pub rules: Vec<ModuleRule>,
}

impl Module {
    /// `auto|overlay|magic` collapse to `hymofs` for the kernel-shim planner.
    pub fn default_mode_hymofs(&self) -> bool {
        !matches!(self.mode.as_str(), "none")
    }

    pub fn normalised_default_mode(&self) -> &str {
        match self.mode.as_str() {
            "auto" | "overlay" | "magic" => "hymofs",
            other => other,
        }
    }

    /// Longest-prefix-match of `virtual_path` against this module's rules.
    /// Exact match counts as a prefix; a partial match must land on a `/`
    /// boundary. Ties (equal-length matches) favour the *first* rule in
    /// the vector, matching the source's strict `>`-on-length comparison.
    pub fn resolve_mode(&self, virtual_path: &str) -> RuleMode {
        let mut best: Option<(&ModuleRule, usize)> = None;
        for rule in &self.rules {
            let matches = virtual_path == rule.path
                || (virtual_path.len() > rule.path.len()
                    && virtual_path.starts_with(&rule.path)
                    && virtual_path.as_bytes()[rule.path.len()] == b'/');
            if !matches {
                continue;
            }
            let len = rule.path.len();
            match best {
                Some((_, best_len)) if len <= best_len => {}
                _ => best = Some((rule, len)),
            }
        }
        match best {
            Some((rule, _)) => rule.mode.clone(),
            None => {
                if self.normalised_default_mode() == "none" {
                    RuleMode::None
                } else {
                    RuleMode::HymoFs
                }
            }
        }
    }
}

fn is_disabled(module_path: &Path) -> bool {
    [DISABLE_FILE_NAME, REMOVE_FILE_NAME, SKIP_MOUNT_FILE_NAME]
        .iter()
        .any(|marker| module_path.join(marker).exists())
}

fn parse_module_prop_mode(module_path: &Path) -> Option<String> {
    let content = fs::read_to_string(module_path.join(MODULE_PROP_FILE_NAME)).ok()?;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=')
            && key == "mode"
        {
            return Some(value.to_string());
        }
    }
    None
}

fn parse_module_rules(module_path: &Path) -> Vec<ModuleRule> {
    let Ok(content) = fs::read_to_string(module_path.join(MODULE_RULES_FILE_NAME)) else {
        return Vec::new();
    };

    content
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (path, mode) = line.split_once('=')?;
            Some(ModuleRule {
                path: path.trim().to_string(),
                mode: RuleMode::parse(mode.trim().to_lowercase().as_str()),
            })
        })
        .collect()
}

/// Enumerate modules under `source_dir`, sorted by id **descending** —
/// this ordering fixes priority for the planner's reverse emission walk.
pub fn scan_modules(source_dir: &Path) -> Vec<Module> {
    let Ok(entries) = fs::read_dir(source_dir) else {
        return Vec::new();
    };

    let mut modules = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                error!("failed to read module dir entry: {e}");
                continue;
            }
        };

        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let id = entry.file_name().to_string_lossy().into_owned();
        if RESERVED_MODULE_IDS.contains(&id.as_str()) || is_disabled(&path) {
            continue;
        }

        let mode = parse_module_prop_mode(&path).unwrap_or_else(|| "auto".to_string());
        let rules = parse_module_rules(&path);

        modules.push(Module { id, source_path: path, mode, rules });
    }

    modules.sort_by(|a, b| b.id.cmp(&a.id));
    modules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_module(root: &Path, id: &str, mode: Option<&str>, rules: Option<&str>) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        if let Some(mode) = mode {
            fs::write(dir.join(MODULE_PROP_FILE_NAME), format!("name=Test\nmode={mode}\n")).unwrap();
        }
        if let Some(rules) = rules {
            fs::write(dir.join(MODULE_RULES_FILE_NAME), rules).unwrap();
        }
    }

    #[test]
    fn scan_orders_descending_and_skips_reserved() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "10_b", None, None);
        write_module(dir.path(), "99_a", None, None);
        fs::create_dir_all(dir.path().join("hymo")).unwrap();

        let modules = scan_modules(dir.path());
        let ids: Vec<_> = modules.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["99_a".to_string(), "10_b".to_string()]);
    }

    #[test]
    fn disabled_markers_skip_module() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "10_b", None, None);
        fs::write(dir.path().join("10_b").join(DISABLE_FILE_NAME), "").unwrap();

        assert!(scan_modules(dir.path()).is_empty());
    }

    #[test]
    fn module_prop_mode_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "10_b", Some("none"), None);
        let modules = scan_modules(dir.path());
        assert_eq!(modules[0].mode, "none");
    }

    #[test]
    fn longest_prefix_match_wins_with_boundary() {
        let module = Module {
            id: "x".to_string(),
            source_path: PathBuf::new(),
            mode: "auto".to_string(),
            rules: vec![
                ModuleRule { path: "/system/lib".to_string(), mode: RuleMode::Hide },
                ModuleRule { path: "/system/lib/debug".to_string(), mode: RuleMode::HymoFs },
            ],
        };
        assert_eq!(module.resolve_mode("/system/lib/debug/trace.so"), RuleMode::HymoFs);
        assert_eq!(module.resolve_mode("/system/libexec/foo"), RuleMode::HymoFs);
        assert_eq!(module.resolve_mode("/system/lib/other.so"), RuleMode::Hide);
    }

    #[test]
    fn tie_break_favours_first_rule_in_vector() {
        let module = Module {
            id: "x".to_string(),
            source_path: PathBuf::new(),
            mode: "auto".to_string(),
            rules: vec![
                ModuleRule { path: "/system/lib".to_string(), mode: RuleMode::Hide },
                ModuleRule { path: "/system/lib".to_string(), mode: RuleMode::None },
            ],
        };
        assert_eq!(module.resolve_mode("/system/lib"), RuleMode::Hide);
    }
}
