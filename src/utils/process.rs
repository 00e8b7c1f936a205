// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs::File;
use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result, bail};
use nix::sched::{CloneFlags, setns};

/// Enter PID 1's mount namespace, required before the magic-mount executor
/// touches the live mount table.
pub fn enter_pid1_mount_ns() -> Result<()> {
    let file = File::open("/proc/1/ns/mnt").context("failed to open /proc/1/ns/mnt")?;
    setns(file.as_raw_fd(), CloneFlags::CLONE_NEWNS).context("setns into pid 1 mount namespace failed")?;
    Ok(())
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub fn require_root(context: &str) -> Result<()> {
    if !is_root() {
        bail!("{context} must run as uid 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_root_reports_context_in_message() {
        if is_root() {
            return;
        }
        let err = require_root("magic-mount").unwrap_err();
        assert!(err.to_string().contains("magic-mount"));
    }
}
