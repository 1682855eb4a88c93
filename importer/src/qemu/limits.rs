//! Resource limits for short-lived `qemu-img` invocations.
//!
//! Applied from a `pre_exec` hook, after `fork()` and before `exec()`, so
//! only async-signal-safe calls are made here.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

#[cfg(target_os = "linux")]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(target_os = "linux"))]
type RlimitResource = libc::c_int;

/// Limits applied to a child process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessLimits {
    /// Address space (bytes)
    pub max_memory: Option<u64>,
    /// CPU time (seconds)
    pub max_cpu_secs: Option<u64>,
}

/// Apply `limits` to the calling process.
///
/// # Safety
///
/// Only `setrlimit` is called. Do not add logging, allocation or locking.
pub fn apply_limits_raw(limits: &ProcessLimits) -> Result<(), i32> {
    if let Some(max_mem) = limits.max_memory {
        set_rlimit_raw(libc::RLIMIT_AS, max_mem)?;
    }
    if let Some(max_cpu) = limits.max_cpu_secs {
        set_rlimit_raw(libc::RLIMIT_CPU, max_cpu)?;
    }
    Ok(())
}

#[inline]
fn set_rlimit_raw(resource: RlimitResource, limit: u64) -> Result<(), i32> {
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    let result = unsafe { libc::setrlimit(resource, &rlim) };
    if result != 0 {
        return Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL));
    }
    Ok(())
}

/// Arrange for `limits` to be applied to the child spawned by `cmd`.
pub fn limit_command(cmd: &mut Command, limits: ProcessLimits) {
    unsafe {
        cmd.pre_exec(move || {
            apply_limits_raw(&limits).map_err(io::Error::from_raw_os_error)
        });
    }
}
