// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

pub const BASE_DIR: &str = "/data/adb/hymo/";
pub const RUN_DIR: &str = "/data/adb/hymo/run/";
pub const STATE_FILE: &str = "/data/adb/hymo/run/daemon_state.json";
pub const CONFIG_FILE_DEFAULT: &str = "/data/adb/hymo/config.toml";
pub const LKM_KO: &str = "/data/adb/modules/hymo/hymofs_lkm.ko";
pub const LKM_AUTOLOAD_FILE: &str = "/data/adb/hymo/lkm_autoload";
pub const USER_HIDE_RULES_FILE: &str = "/data/adb/hymo/user_hide_rules";

pub const MODULES_DIR: &str = "/data/adb/modules";
pub const RESERVED_MODULE_IDS: &[&str] = &["hymo", "lost+found", ".git"];

pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skip_mount";
pub const MODULE_PROP_FILE_NAME: &str = "module.prop";
pub const MODULE_RULES_FILE_NAME: &str = "hymo_rules.conf";

pub const BUILTIN_PARTITIONS: &[&str] =
    &["system", "vendor", "product", "system_ext", "odm", "oem"];

/// Partitions lifted out from under a `system-as-root` synthetic `system`
/// node when realised through the magic-mount planner.
pub const LIFTABLE_PARTITIONS: &[&str] = &["vendor", "product", "system_ext", "odm"];

pub const REPLACE_DIR_XATTR: &str = "trusted.overlay.opaque";

pub const SELINUX_XATTR: &str = "security.selinux";
pub const DEFAULT_SELINUX_CONTEXT: &str = "u:object_r:system_file:s0";
pub const VENDOR_SELINUX_CONTEXT: &str = "u:object_r:vendor_file:s0";

pub const HYMO_HOOK_MASK_ENV: &str = "HYMO_HOOK_MASK";

/// Candidate scratch directories for the magic-mount tmpfs workspace,
/// tried in order.
pub const TMPFS_CANDIDATES: &[&str] = &["/mnt/vendor", "/mnt", "/debug_ramdisk"];
pub const FALLBACK_TMPFS_DIR: &str = "/dev/.magic_mount";

pub const DEFAULT_MOUNT_SOURCE: &str = "HYMO";
