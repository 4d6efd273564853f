/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Direct kernel entry for the handful of system calls the thread-modifier
//! helper task needs.
//!
//! The helper task created by [`crate::modify_thread`] runs outside the
//! calling thread group with a hand-built TLS block, so nothing here may go
//! through a libc wrapper: any wrapper that stores to the thread-local
//! `errno` would fault. Every function returns the raw kernel value, with
//! errors encoded as `-errno`.

use libc::c_void;
use syscalls::raw_syscall;
use syscalls::Sysno;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
use aarch64 as arch;
#[cfg(target_arch = "x86_64")]
use x86_64 as arch;

/// The function run on the child side of [`clone`]. The returned value
/// becomes the task's exit status.
pub type CloneFn = extern "C" fn(*mut c_void) -> i32;

/// Retries `read`/`write` style calls that the kernel interrupted.
macro_rules! retry_on_eintr {
    ($call:expr) => {{
        let mut res;
        loop {
            res = $call;
            if res != -(libc::EINTR as isize) {
                break;
            }
        }
        res
    }};
}

/// Reads from `fd`, retrying on `EINTR`.
pub unsafe fn read(fd: i32, buf: *mut u8, count: usize) -> isize {
    retry_on_eintr!(raw_syscall!(Sysno::read, fd as usize, buf as usize, count) as isize)
}

/// Writes to `fd`, retrying on `EINTR`.
pub unsafe fn write(fd: i32, buf: *const u8, count: usize) -> isize {
    retry_on_eintr!(raw_syscall!(Sysno::write, fd as usize, buf as usize, count) as isize)
}

/// Waits for the task `pid`. `options` takes the usual `wait4` flags,
/// including `__WALL` and `__WCLONE`.
pub unsafe fn waitpid(pid: i32, status: *mut i32, options: i32) -> isize {
    raw_syscall!(
        Sysno::wait4,
        pid as usize,
        status as usize,
        options as usize,
        0usize
    ) as isize
}

/// Issues a raw `ptrace` request.
pub unsafe fn ptrace(request: usize, pid: i32, addr: usize, data: usize) -> isize {
    raw_syscall!(Sysno::ptrace, request, pid as usize, addr, data) as isize
}

/// Spawns a new task running `child_func(arg)` on `child_stack`.
///
/// Unlike the libc wrapper, the child branch never returns through a
/// library epilogue: when `child_func` returns, the trampoline invokes the
/// `exit` system call directly with its return value. On x86-64 the child
/// installs `tls` as its thread pointer via `arch_prctl(ARCH_SET_FS)`
/// before calling `child_func`; on aarch64 `tls` rides the regular
/// `CLONE_SETTLS` argument.
///
/// `child_stack` must point one-past-the-end of a mapped, writable region.
pub unsafe fn clone(
    child_func: CloneFn,
    child_stack: *mut c_void,
    flags: i32,
    arg: *mut c_void,
    tls: *mut c_void,
) -> isize {
    arch::clone(child_func, child_stack, flags, arg, tls)
}
