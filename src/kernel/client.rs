// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{error, info, warn};

use super::protocol::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HymoFsStatus {
    Available,
    NotPresent,
    KernelTooOld,
    ModuleTooOld,
}

/// Process-wide cached fd and handshake status. A struct behind a single
/// `Mutex`, rather than scattered statics, so tests can reset it — the fd
/// and status otherwise live for the process's whole lifetime, per the
/// single-threaded, no-close design.
struct ClientState {
    fd: Option<RawFd>,
    status: Option<HymoFsStatus>,
}

impl ClientState {
    const fn new() -> Self {
        Self { fd: None, status: None }
    }
}

static STATE: Mutex<ClientState> = Mutex::new(ClientState::new());

fn get_anon_fd_legacy() -> Result<RawFd> {
    let ret = unsafe { libc::syscall(libc::SYS_reboot, HYMO_MAGIC1, HYMO_MAGIC2, HYMO_CMD_GET_FD, 0) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) {
            warn!("got EINVAL acquiring HymoFS fd: kernel reboot hook not active");
        }
        anyhow::bail!("failed to get HymoFS anonymous fd: {err}");
    }
    info!("HymoFS: got anonymous fd {ret}");
    Ok(ret as RawFd)
}

fn get_anon_fd_with_mask(mask: u64) -> Result<RawFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_reboot,
            HYMO_MAGIC1,
            HYMO_MAGIC2,
            HYMO_CMD_GET_FD_WITH_MASK,
            mask as usize,
        )
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) {
            warn!("got EINVAL bootstrapping HymoFS fd: kernel reboot hook not active");
        }
        anyhow::bail!("failed to bootstrap HymoFS fd with mask 0x{mask:x}: {err}");
    }
    info!("HymoFS: bootstrapped anonymous fd {ret} (mask=0x{mask:x})");
    Ok(ret as RawFd)
}

fn get_anon_fd(state: &mut ClientState) -> Result<RawFd> {
    if let Some(fd) = state.fd {
        return Ok(fd);
    }

    let fd = if let Ok(env_mask) = std::env::var(crate::defs::HYMO_HOOK_MASK_ENV) {
        match parse_u64_flexible(&env_mask) {
            Some(mask) => get_anon_fd_with_mask(mask)?,
            None => get_anon_fd_legacy()?,
        }
    } else {
        get_anon_fd_legacy()?
    };

    state.fd = Some(fd);
    Ok(fd)
}

fn parse_u64_flexible(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    }
}

fn execute_cmd(state: &mut ClientState, cmd: u32, arg: *mut std::ffi::c_void) -> Result<i32> {
    let fd = get_anon_fd(state)?;
    let call = HymoIoctlCall { cmd, reserved: 0, arg: arg as u64 };
    let ret = unsafe { libc::ioctl(fd, HYMO_IOC_CALL as _, &call) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        error!("HymoFS ioctl cmd={cmd} failed: {err}");
    }
    Ok(ret)
}

pub struct HymoClient;

impl HymoClient {
    pub fn bootstrap_with_mask(mask: u64) -> bool {
        let mut state = STATE.lock().unwrap();
        if state.fd.is_some() {
            return true;
        }
        state.status = None;
        match get_anon_fd_with_mask(mask) {
            Ok(fd) => {
                state.fd = Some(fd);
                true
            }
            Err(e) => {
                warn!("bootstrap_with_mask failed: {e:#}");
                false
            }
        }
    }

    fn get_protocol_version(state: &mut ClientState) -> Result<i32> {
        let mut version: i32 = 0;
        let ret = execute_cmd(state, CMD_GET_VERSION, &mut version as *mut _ as *mut _)?;
        if ret < 0 {
            anyhow::bail!("GET_VERSION failed");
        }
        Ok(version)
    }

    pub fn check_status() -> HymoFsStatus {
        let mut state = STATE.lock().unwrap();
        if let Some(status) = state.status {
            return status;
        }

        let status = match Self::get_protocol_version(&mut state) {
            Err(_) => {
                warn!("HymoFS check_status: NotPresent (syscall failed)");
                HymoFsStatus::NotPresent
            }
            Ok(v) if v < HYMO_PROTOCOL_VERSION => {
                warn!("HymoFS check_status: KernelTooOld (got {v}, expected {HYMO_PROTOCOL_VERSION})");
                HymoFsStatus::KernelTooOld
            }
            Ok(v) if v > HYMO_PROTOCOL_VERSION => {
                warn!("HymoFS check_status: ModuleTooOld (got {v}, expected {HYMO_PROTOCOL_VERSION})");
                HymoFsStatus::ModuleTooOld
            }
            Ok(v) => {
                info!("HymoFS check_status: Available (version {v})");
                HymoFsStatus::Available
            }
        };

        state.status = Some(status);
        status
    }

    pub fn is_available() -> bool {
        Self::check_status() == HymoFsStatus::Available
    }

    pub fn clear_rules() -> bool {
        let mut state = STATE.lock().unwrap();
        info!("HymoFS: clearing all rules");
        match execute_cmd(&mut state, CMD_CLEAR_ALL, std::ptr::null_mut()) {
            Ok(ret) => ret >= 0,
            Err(_) => false,
        }
    }

    fn syscall_arg_cmd(cmd: u32, src: &str, target: Option<&str>, r#type: i32) -> bool {
        let mut state = STATE.lock().unwrap();
        let Ok(c_src) = CString::new(src) else { return false };
        let c_target = target.and_then(|t| CString::new(t).ok());
        let arg = HymoSyscallArg {
            src: c_src.as_ptr(),
            target: c_target.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()),
            r#type,
        };
        match execute_cmd(&mut state, cmd, &arg as *const _ as *mut _) {
            Ok(ret) => ret >= 0,
            Err(_) => false,
        }
    }

    pub fn add_rule(src: &str, target: &str, dirent_type: i32) -> bool {
        info!("HymoFS: add_rule src={src} target={target} type={dirent_type}");
        Self::syscall_arg_cmd(CMD_ADD_RULE, src, Some(target), dirent_type)
    }

    pub fn add_merge_rule(src: &str, target: &str) -> bool {
        info!("HymoFS: add_merge_rule src={src} target={target}");
        Self::syscall_arg_cmd(CMD_ADD_MERGE_RULE, src, Some(target), 0)
    }

    pub fn hide_path(src: &str) -> bool {
        info!("HymoFS: hide_path src={src}");
        Self::syscall_arg_cmd(CMD_HIDE_RULE, src, None, 0)
    }

    pub fn hide_overlay_xattrs(src: &str) -> bool {
        Self::syscall_arg_cmd(CMD_HIDE_OVERLAY_XATTRS, src, None, 0)
    }

    pub fn delete_rule(src: &str) -> bool {
        Self::syscall_arg_cmd(CMD_DEL_RULE, src, None, 0)
    }

    pub fn set_mirror_path(path: &str) -> bool {
        Self::syscall_arg_cmd(CMD_SET_MIRROR_PATH, path, None, 0)
    }

    fn int_cmd(cmd: u32, value: i32) -> bool {
        let mut state = STATE.lock().unwrap();
        let mut val = value;
        match execute_cmd(&mut state, cmd, &mut val as *mut _ as *mut _) {
            Ok(ret) => ret >= 0,
            Err(_) => false,
        }
    }

    pub fn set_debug(enable: bool) -> bool {
        Self::int_cmd(CMD_SET_DEBUG, enable as i32)
    }

    pub fn set_stealth(enable: bool) -> bool {
        Self::int_cmd(CMD_SET_STEALTH, enable as i32)
    }

    pub fn set_enabled(enable: bool) -> bool {
        let ok = Self::int_cmd(CMD_SET_ENABLED, enable as i32);
        if ok {
            info!("HymoFS is now {}", if enable { "enabled" } else { "disabled" });
        }
        ok
    }

    pub fn fix_mounts() -> bool {
        let mut state = STATE.lock().unwrap();
        match execute_cmd(&mut state, CMD_REORDER_MNT_ID, std::ptr::null_mut()) {
            Ok(ret) => ret >= 0,
            Err(_) => false,
        }
    }

    pub fn set_hook_mask(mask: u64) -> bool {
        let mut state = STATE.lock().unwrap();
        let mut m = mask;
        match execute_cmd(&mut state, CMD_SET_HOOK_MASK, &mut m as *mut _ as *mut _) {
            Ok(ret) => ret >= 0,
            Err(_) => false,
        }
    }

    /// Lists the kernel's currently active rules, for `hymod status`
    /// diagnostics. Returns the raw kernel text; format is kernel-defined.
    pub fn get_active_rules() -> Result<String> {
        let mut state = STATE.lock().unwrap();
        const BUF_SIZE: usize = 16 * 1024;
        let mut buf = vec![0u8; BUF_SIZE];
        let mut arg = HymoSyscallListArg {
            buf: buf.as_mut_ptr() as *mut _,
            size: BUF_SIZE,
        };
        let ret = execute_cmd(&mut state, CMD_LIST_RULES, &mut arg as *mut _ as *mut _)
            .context("LIST_RULES ioctl failed")?;
        if ret < 0 {
            anyhow::bail!("LIST_RULES command failed");
        }
        let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..nul]).into_owned())
    }

    #[cfg(test)]
    pub fn reset_for_test() {
        let mut state = STATE.lock().unwrap();
        state.fd = None;
        state.status = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_caches_without_kernel() {
        HymoClient::reset_for_test();
        let first = HymoClient::check_status();
        let second = HymoClient::check_status();
        assert_eq!(first, second);
        assert_eq!(first, HymoFsStatus::NotPresent);
    }

    #[test]
    fn parse_u64_flexible_accepts_hex_and_decimal() {
        assert_eq!(parse_u64_flexible("0x3ff"), Some(0x3ff));
        assert_eq!(parse_u64_flexible("1023"), Some(1023));
        assert_eq!(parse_u64_flexible("not a number"), None);
    }
}
