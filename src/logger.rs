// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::io::Write;
use std::path::Path;

use anyhow::Result;

/// Initialise the `log` facade. On Android this routes through `logcat`
/// via `android_logger`; elsewhere (desktop builds, tests, CI) it writes
/// to `log_path` in the `[LEVEL] [target] message` shape, falling back to
/// stderr if the file can't be opened.
pub fn init(verbose: bool, log_path: &Path) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag("hymod"),
        );
        Ok(())
    }

    #[cfg(not(target_os = "android"))]
    {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_appender = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        env_logger::Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(buf, "[{}] [{}] {}", record.level(), record.target(), record.args())
            })
            .target(env_logger::Target::Pipe(Box::new(file_appender)))
            .try_init()
            .ok();
        Ok(())
    }
}
