// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Wire layout for the HymoFS kernel control plane. Struct layouts, command
// numbers, and the magic handshake tuple are load-bearing: they are the
// contract with an unmodifiable kernel counterpart and must be reproduced
// bit-exact.

use std::os::raw::{c_char, c_int};

pub const HYMO_MAGIC1: libc::c_long = 0x4859_4D4F;
pub const HYMO_MAGIC2: libc::c_long = 0x524F_4F54;

pub const HYMO_CMD_GET_FD: libc::c_long = 0x4_8021;
pub const HYMO_CMD_GET_FD_WITH_MASK: libc::c_long = 0x4_8022;

pub const HYMO_PROTOCOL_VERSION: i32 = 12;

pub const CMD_CLEAR_ALL: u32 = 100;
pub const CMD_GET_VERSION: u32 = 101;
pub const CMD_SET_DEBUG: u32 = 102;
pub const CMD_REORDER_MNT_ID: u32 = 103;
pub const CMD_SET_STEALTH: u32 = 104;
pub const CMD_SET_ENABLED: u32 = 105;
pub const CMD_LIST_RULES: u32 = 106;
pub const CMD_SET_MIRROR_PATH: u32 = 107;
pub const CMD_ADD_MERGE_RULE: u32 = 108;
pub const CMD_ADD_RULE: u32 = 109;
pub const CMD_HIDE_RULE: u32 = 110;
pub const CMD_HIDE_OVERLAY_XATTRS: u32 = 111;
pub const CMD_DEL_RULE: u32 = 112;
pub const CMD_ADD_SPOOF_KSTAT: u32 = 113;
pub const CMD_UPDATE_SPOOF_KSTAT: u32 = 114;
pub const CMD_SET_UNAME: u32 = 115;
pub const CMD_SET_CMDLINE: u32 = 116;
pub const CMD_SET_HOOK_MASK: u32 = 117;

pub const HYMO_UNAME_LEN: usize = 65;
pub const HYMO_MAX_LEN_PATHNAME: usize = 256;
pub const HYMO_FAKE_CMDLINE_SIZE: usize = 4096;

/// `_IOW('H', 22, struct hymo_ioctl_call)`.
pub const HYMO_IOC_CALL: libc::c_ulong = ioc_write::<HymoIoctlCall>('H' as u32, 22);

#[repr(C)]
pub struct HymoIoctlCall {
    pub cmd: u32,
    pub reserved: u32,
    pub arg: u64,
}

#[repr(C)]
pub struct HymoSyscallArg {
    pub src: *const c_char,
    pub target: *const c_char,
    pub r#type: c_int,
}

#[repr(C)]
pub struct HymoSyscallListArg {
    pub buf: *mut c_char,
    pub size: usize,
}

#[repr(C)]
pub struct HymoSpoofKstat {
    pub target_ino: u64,
    pub target_pathname: [c_char; HYMO_MAX_LEN_PATHNAME],
    pub spoofed_ino: u64,
    pub spoofed_dev: u64,
    pub spoofed_nlink: u32,
    pub spoofed_size: i64,
    pub spoofed_atime_sec: i64,
    pub spoofed_atime_nsec: i64,
    pub spoofed_mtime_sec: i64,
    pub spoofed_mtime_nsec: i64,
    pub spoofed_ctime_sec: i64,
    pub spoofed_ctime_nsec: i64,
    pub spoofed_blksize: u64,
    pub spoofed_blocks: u64,
    pub is_static: c_int,
    pub err: c_int,
}

#[repr(C)]
pub struct HymoSpoofUname {
    pub sysname: [c_char; HYMO_UNAME_LEN],
    pub nodename: [c_char; HYMO_UNAME_LEN],
    pub release: [c_char; HYMO_UNAME_LEN],
    pub version: [c_char; HYMO_UNAME_LEN],
    pub machine: [c_char; HYMO_UNAME_LEN],
    pub domainname: [c_char; HYMO_UNAME_LEN],
    pub err: c_int,
}

#[repr(C)]
pub struct HymoSpoofCmdline {
    pub cmdline: [c_char; HYMO_FAKE_CMDLINE_SIZE],
    pub err: c_int,
}

// Minimal const-fn _IOW reimplementation (Linux ioctl number encoding),
// mirroring the bit layout asm-generic/ioctl.h uses on arm64/x86_64.
mod ioc_write_impl {
    pub const NRBITS: u32 = 8;
    pub const TYPEBITS: u32 = 8;
    pub const SIZEBITS: u32 = 14;

    pub const NRSHIFT: u32 = 0;
    pub const TYPESHIFT: u32 = NRSHIFT + NRBITS;
    pub const SIZESHIFT: u32 = TYPESHIFT + TYPEBITS;
    pub const DIRSHIFT: u32 = SIZESHIFT + SIZEBITS;

    pub const WRITE: u32 = 1;
}

pub const fn ioc_write<T>(kind: u32, nr: u32) -> libc::c_ulong {
    use ioc_write_impl::*;
    ((WRITE << DIRSHIFT)
        | (kind << TYPESHIFT)
        | (nr << NRSHIFT)
        | ((std::mem::size_of::<T>() as u32) << SIZESHIFT)) as libc::c_ulong
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_call_struct_is_16_bytes() {
        assert_eq!(std::mem::size_of::<HymoIoctlCall>(), 16);
    }

    #[test]
    fn protocol_version_matches_kernel_contract() {
        assert_eq!(HYMO_PROTOCOL_VERSION, 12);
    }
}
