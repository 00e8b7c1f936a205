// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::ffi::CString;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use extattr::{Flags as XattrFlags, lgetxattr, lsetxattr};

use crate::defs::{DEFAULT_SELINUX_CONTEXT, REPLACE_DIR_XATTR, SELINUX_XATTR, VENDOR_SELINUX_CONTEXT};

const TMPFS_MAGIC: i64 = 0x0102_1994;

pub fn path_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

pub fn is_dir(path: &Path) -> bool {
    path.metadata().map(|m| m.is_dir()).unwrap_or(false)
}

pub fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

pub fn mkdir_recursive(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

/// Whether `path` sits on a writable tmpfs mount, checked with `statfs(2)`,
/// matching the magic-mount scratch-directory probe.
pub fn is_rw_tmpfs(path: &Path) -> bool {
    let c_path = match CString::new(path.as_os_str().as_encoded_bytes()) {
        Ok(p) => p,
        Err(_) => return false,
    };
    unsafe {
        let mut buf: libc::statfs = std::mem::zeroed();
        if libc::statfs(c_path.as_ptr(), &mut buf) != 0 {
            return false;
        }
        if buf.f_type as i64 != TMPFS_MAGIC {
            return false;
        }
        libc::access(c_path.as_ptr(), libc::W_OK) == 0
    }
}

/// First candidate from `TMPFS_CANDIDATES` that's a writable tmpfs, else
/// `FALLBACK_TMPFS_DIR`.
pub fn select_tmpfs_dir() -> PathBuf {
    for candidate in crate::defs::TMPFS_CANDIDATES {
        let p = Path::new(candidate);
        if is_rw_tmpfs(p) {
            return p.to_path_buf();
        }
    }
    PathBuf::from(crate::defs::FALLBACK_TMPFS_DIR)
}

pub fn get_selinux_context(path: &Path) -> Option<String> {
    lgetxattr(path, SELINUX_XATTR)
        .ok()
        .map(|v| String::from_utf8_lossy(&v).trim_end_matches('\0').to_string())
}

pub fn set_selinux_context(path: &Path, ctx: &str) -> Result<()> {
    lsetxattr(path, SELINUX_XATTR, ctx.as_bytes(), XattrFlags::empty())
        .with_context(|| format!("failed to set selinux context on {}", path.display()))
}

pub fn copy_selinux_context(src: &Path, dst: &Path) {
    if let Some(ctx) = get_selinux_context(src) {
        let _ = set_selinux_context(dst, &ctx);
    }
}

/// SELinux context to fall back to when `src` carries none, based on
/// whether the virtual path lives under `/vendor`.
pub fn default_context_for(virtual_path: &Path) -> &'static str {
    if virtual_path.starts_with("/vendor") {
        VENDOR_SELINUX_CONTEXT
    } else {
        DEFAULT_SELINUX_CONTEXT
    }
}

pub fn is_dir_opaque(path: &Path) -> bool {
    lgetxattr(path, REPLACE_DIR_XATTR)
        .map(|v| v.first() == Some(&b'y'))
        .unwrap_or(false)
}

pub fn set_dir_opaque(path: &Path) -> Result<()> {
    lsetxattr(path, REPLACE_DIR_XATTR, b"y", XattrFlags::empty())
        .with_context(|| format!("failed to mark {} opaque", path.display()))
}

/// Whiteout convention: a character device with `rdev == 0`, checked via
/// `lstat` so symlinks are never dereferenced.
pub fn is_whiteout(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_char_device() && metadata.rdev() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_picks_vendor_for_vendor_paths() {
        assert_eq!(default_context_for(Path::new("/vendor/lib/foo.so")), VENDOR_SELINUX_CONTEXT);
        assert_eq!(default_context_for(Path::new("/system/bin/foo")), DEFAULT_SELINUX_CONTEXT);
    }

    #[test]
    fn nonexistent_path_is_not_rw_tmpfs() {
        assert!(!is_rw_tmpfs(Path::new("/does/not/exist/at/all")));
    }

    #[test]
    fn path_exists_reports_symlink_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert!(path_exists(&file));
        assert!(!path_exists(&dir.path().join("missing")));
    }
}
