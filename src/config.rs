// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::defs::{CONFIG_FILE_DEFAULT, MODULES_DIR};

fn default_moduledir() -> PathBuf {
    PathBuf::from(MODULES_DIR)
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(MODULES_DIR)
}

fn deserialize_partitions_flexible<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::Vec(v) => Ok(v),
        StringOrVec::String(s) => Ok(s
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()),
    }
}

/// Planner configuration, loaded from TOML and overridable from the CLI.
///
/// `storage_root` defaults to `moduledir` — callers that populate a
/// separate synced mirror should point it elsewhere.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_moduledir")]
    pub moduledir: PathBuf,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default)]
    pub tempdir: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_partitions_flexible")]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub ignore_protocol_mismatch: bool,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            moduledir: default_moduledir(),
            storage_root: default_storage_root(),
            tempdir: None,
            partitions: Vec::new(),
            ignore_protocol_mismatch: false,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let config: Config = toml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::from_file(CONFIG_FILE_DEFAULT)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        fs::write(path.as_ref(), content).context("failed to write config file")?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli(
        &mut self,
        moduledir: Option<PathBuf>,
        storage_root: Option<PathBuf>,
        tempdir: Option<PathBuf>,
        verbose: bool,
        partitions: Vec<String>,
        ignore_protocol_mismatch: bool,
    ) {
        if let Some(dir) = moduledir {
            self.moduledir = dir;
        }
        if let Some(dir) = storage_root {
            self.storage_root = dir;
        }
        if tempdir.is_some() {
            self.tempdir = tempdir;
        }
        if verbose {
            self.verbose = true;
        }
        if !partitions.is_empty() {
            self.partitions = partitions;
        }
        if ignore_protocol_mismatch {
            self.ignore_protocol_mismatch = true;
        }
    }

    /// `BUILTIN_PARTITIONS` plus any caller-configured extras.
    pub fn target_partitions(&self) -> Vec<String> {
        let mut parts: Vec<String> = crate::defs::BUILTIN_PARTITIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
        parts.extend(self.partitions.iter().cloned());
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_builtin_moduledir() {
        let cfg = Config::default();
        assert_eq!(cfg.moduledir, PathBuf::from(MODULES_DIR));
        assert_eq!(cfg.storage_root, PathBuf::from(MODULES_DIR));
        assert!(!cfg.ignore_protocol_mismatch);
    }

    #[test]
    fn target_partitions_appends_extras() {
        let mut cfg = Config::default();
        cfg.partitions = vec!["mi_ext".to_string()];
        let parts = cfg.target_partitions();
        assert_eq!(parts.len(), crate::defs::BUILTIN_PARTITIONS.len() + 1);
        assert_eq!(parts.last().unwrap(), "mi_ext");
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.partitions = vec!["a".to_string(), "b".to_string()];
        cfg.ignore_protocol_mismatch = true;
        cfg.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.partitions, cfg.partitions);
        assert!(loaded.ignore_protocol_mismatch);
    }

    #[test]
    fn accepts_comma_separated_partitions_string() {
        let toml_str = "partitions = \"a, b ,c\"\n";
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.partitions, vec!["a", "b", "c"]);
    }
}
