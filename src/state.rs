// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::defs::STATE_FILE;

/// Diagnostics-only snapshot of the last planner run. Never consulted by
/// the planner itself — rules are reconstructed from disk on every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub backend: String,
    pub timestamp: DateTime<Utc>,
    pub hymofs_module_ids: Vec<String>,
    pub pid: u32,
    #[serde(default)]
    pub magic_mount_stats: Option<MagicMountStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MagicMountStats {
    pub modules_total: u32,
    pub nodes_total: u32,
    pub nodes_mounted: u32,
    pub nodes_skipped: u32,
    pub nodes_whiteout: u32,
    pub nodes_fail: u32,
    pub failed_modules: Vec<String>,
}

impl RuntimeState {
    pub fn for_hymofs(now: DateTime<Utc>, hymofs_module_ids: Vec<String>) -> Self {
        Self {
            backend: "hymofs".to_string(),
            timestamp: now,
            hymofs_module_ids,
            pid: std::process::id(),
            magic_mount_stats: None,
        }
    }

    pub fn for_magic_mount(now: DateTime<Utc>, stats: MagicMountStats) -> Self {
        Self {
            backend: "magic".to_string(),
            timestamp: now,
            hymofs_module_ids: Vec::new(),
            pid: std::process::id(),
            magic_mount_stats: Some(stats),
        }
    }

    /// Best-effort: a write failure is logged by the caller and never
    /// fails the planner run.
    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(STATE_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create run directory")?;
        }
        let file = fs::File::create(path).context("failed to create state file")?;
        serde_json::to_writer_pretty(file, self).context("failed to serialize runtime state")?;
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("failed to read state file")?;
        serde_json::from_str(&content).context("failed to parse state file")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(STATE_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_hymofs_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");
        let state = RuntimeState::for_hymofs(Utc::now(), vec!["10_foo".to_string()]);
        state.save_to(&path).unwrap();

        let loaded = RuntimeState::load_from(&path).unwrap();
        assert_eq!(loaded.backend, "hymofs");
        assert_eq!(loaded.hymofs_module_ids, vec!["10_foo".to_string()]);
        assert!(loaded.magic_mount_stats.is_none());
    }

    #[test]
    fn round_trips_magic_mount_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");
        let stats = MagicMountStats {
            modules_total: 2,
            nodes_total: 10,
            nodes_mounted: 8,
            nodes_skipped: 1,
            nodes_whiteout: 1,
            nodes_fail: 0,
            failed_modules: Vec::new(),
        };
        let state = RuntimeState::for_magic_mount(Utc::now(), stats);
        state.save_to(&path).unwrap();

        let loaded = RuntimeState::load_from(&path).unwrap();
        assert_eq!(loaded.backend, "magic");
        assert_eq!(loaded.magic_mount_stats.unwrap().nodes_mounted, 8);
    }
}
