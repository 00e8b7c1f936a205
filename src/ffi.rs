// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Thin C ABI surface for the NDK-side shim (component H in the system
// overview table). Each function is a direct wrapper around the kernel
// client and never panics across the FFI boundary.

use std::panic::catch_unwind;

use crate::kernel::{HymoClient, HymoFsStatus};

/// Returns the cached HymoFS status: 0 Available, 1 NotPresent,
/// 2 KernelTooOld, 3 ModuleTooOld, -1 on an internal panic.
#[unsafe(no_mangle)]
pub extern "C" fn hymo_check_status() -> i32 {
    catch_unwind(|| match HymoClient::check_status() {
        HymoFsStatus::Available => 0,
        HymoFsStatus::NotPresent => 1,
        HymoFsStatus::KernelTooOld => 2,
        HymoFsStatus::ModuleTooOld => 3,
    })
    .unwrap_or(-1)
}

/// Clears every active rule. Returns 0 on success, -1 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn hymo_clear_rules() -> i32 {
    catch_unwind(|| if HymoClient::clear_rules() { 0 } else { -1 }).unwrap_or(-1)
}

/// Asks the kernel to reorder mount IDs after an external mount-table
/// change. Returns 0 on success, -1 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn hymo_fix_mounts() -> i32 {
    catch_unwind(|| if HymoClient::fix_mounts() { 0 } else { -1 }).unwrap_or(-1)
}

/// Enables or disables the kernel shim globally. Returns 0 on success,
/// -1 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn hymo_set_enabled(enable: i32) -> i32 {
    catch_unwind(|| if HymoClient::set_enabled(enable != 0) { 0 } else { -1 }).unwrap_or(-1)
}
