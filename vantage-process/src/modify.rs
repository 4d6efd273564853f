/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Suspension and mutation of an arbitrary thread's register state.
//!
//! Reading another thread's registers reliably requires ptrace, and Linux
//! forbids tracing a task in one's own thread group. So for the
//! cross-thread case we clone a helper task *outside* the thread group
//! (`CLONE_VM` without `CLONE_THREAD`) that attaches to the target on our
//! behalf. The helper runs with a hand-built TLS block and must not make
//! any libc call: every syscall it issues goes through [`crate::sys`].
//!
//! An earlier approach, hijacking the target with a directed realtime
//! signal, falls over when the target is blocked in a syscall the kernel
//! does not return from on signal delivery, or is blocked uninterruptibly.

use libc::c_void;
use tracing::debug;

use crate::dumpable;
use crate::regs;
use crate::regs::CpuContext;
use crate::regs::Regs;
use crate::sys;
use crate::thread::current_thread_id;
use crate::thread::ThreadId;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum Ack {
    Ready = 1,
    ReadContext,
    ModifiedContext,
    WroteContext,
    FailedToAttach,
    FailedToWait,
    FailedToStop,
    FailedToRead,
    FailedToWrite,
    FailedToDetach,
}

#[repr(C)]
struct ModifyContext {
    fds: [libc::c_int; 2],
    thread_id: ThreadId,
    cpu_context: CpuContext,
}

// The glibc TCB leader; enough for the helper to survive TLS-relative
// accesses the compiler may emit around its entry point.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
struct TcbHead {
    tcb: *mut c_void,
    dtv: *mut c_void,
    this: *mut c_void,
}

/// Runs `func` with mutable access to `thread_id`'s CPU context while that
/// thread is suspended, then applies whatever the callback changed.
///
/// Returns `false` when the thread could not be modified; the condition is
/// usually transient (the target died, or the helper lost an ack race) and
/// callers typically retry.
pub fn modify_thread<F>(thread_id: ThreadId, func: F) -> bool
where
    F: FnOnce(&mut CpuContext),
{
    if thread_id == current_thread_id() {
        modify_current_thread(func)
    } else {
        modify_other_thread(thread_id, func)
    }
}

/// Captures the calling thread's own context, applies the callback, and
/// resumes at the capture point exactly once with the modified state.
#[cfg(target_env = "gnu")]
fn modify_current_thread<F>(func: F) -> bool
where
    F: FnOnce(&mut CpuContext),
{
    let mut modified = false;
    let mut uc: libc::ucontext_t = unsafe { core::mem::zeroed() };

    // The return value is deliberately ignored: when the callback changes
    // the return-value register, arriving here again through setcontext
    // makes getcontext appear to return that value.
    unsafe {
        libc::getcontext(&mut uc);
    }

    if !unsafe { core::ptr::read_volatile(&modified) } {
        let mut ctx = CpuContext::default();
        ctx.parse_ucontext(&uc);
        func(&mut ctx);
        ctx.unparse_ucontext(&mut uc);

        unsafe {
            core::ptr::write_volatile(&mut modified, true);
            libc::setcontext(&uc);
        }
    }

    true
}

/// musl ships no getcontext/setcontext; the same-thread case is
/// unsupported there, matching the behavior of the C implementation this
/// was modeled on.
#[cfg(not(target_env = "gnu"))]
fn modify_current_thread<F>(_func: F) -> bool
where
    F: FnOnce(&mut CpuContext),
{
    false
}

fn modify_other_thread<F>(thread_id: ThreadId, func: F) -> bool
where
    F: FnOnce(&mut CpuContext),
{
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } != 0 {
        return false;
    }

    let mut ctx = ModifyContext {
        fds,
        thread_id,
        cpu_context: CpuContext::default(),
    };
    let fd = fds[0];

    let page_size = crate::page_size();
    let stack = alloc_page(page_size);
    let tls = alloc_page(page_size);

    let mut success = false;

    if !stack.is_null() && !tls.is_null() {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            let head = tls as *mut TcbHead;
            (*head).tcb = tls;
            (*head).dtv = tls.add(1024);
            (*head).this = tls;
        }

        let child = unsafe {
            sys::clone(
                modify_thread_worker,
                stack.add(page_size),
                libc::CLONE_VM | libc::CLONE_SETTLS,
                &mut ctx as *mut ModifyContext as *mut c_void,
                tls,
            )
        };

        if child > 0 {
            let guard = dumpable::acquire_dumpability();

            unsafe {
                libc::prctl(libc::PR_SET_PTRACER, child);
            }

            put_ack(fd, Ack::Ready);

            if await_ack(fd, Ack::ReadContext) {
                func(&mut ctx.cpu_context);
                put_ack(fd, Ack::ModifiedContext);

                success = await_ack(fd, Ack::WroteContext);
            } else {
                debug!(thread_id, "helper failed before handing over the context");
            }

            drop(guard);

            unsafe {
                sys::waitpid(child as libc::pid_t, core::ptr::null_mut(), libc::__WCLONE);
            }
        }
    }

    unsafe {
        if !tls.is_null() {
            libc::munmap(tls, page_size);
        }
        if !stack.is_null() {
            libc::munmap(stack, page_size);
        }
        libc::close(fds[0]);
        libc::close(fds[1]);
    }

    success
}

fn alloc_page(size: usize) -> *mut c_void {
    let page = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if page == libc::MAP_FAILED {
        core::ptr::null_mut()
    } else {
        page
    }
}

/// The helper task. Runs outside the caller's thread group on a bare page
/// of stack; libc is off-limits from here on.
extern "C" fn modify_thread_worker(arg: *mut c_void) -> i32 {
    let ctx = unsafe { &mut *(arg as *mut ModifyContext) };
    let fd = ctx.fds[1];
    let tid = ctx.thread_id;

    let _ = await_ack(fd, Ack::Ready);

    if unsafe { sys::ptrace(libc::PTRACE_ATTACH as usize, tid, 0, 0) } < 0 {
        put_ack(fd, Ack::FailedToAttach);
        return 0;
    }

    let mut status: i32 = 0;
    let wait_result =
        unsafe { sys::waitpid(tid, &mut status as *mut i32, libc::__WALL) } as libc::pid_t;
    if wait_result != tid {
        return bail(fd, tid, Ack::FailedToWait);
    }

    // ptrace injects SIGSTOP, but the target may already be stopped by
    // some other stop signal (the ptrace man page documents the race).
    // All that matters is that it is stopped.
    if !libc::WIFSTOPPED(status) {
        return bail(fd, tid, Ack::FailedToStop);
    }

    let mut regs: Regs = unsafe { core::mem::zeroed() };
    if unsafe { regs::get_regs(tid, &mut regs) } < 0 {
        return bail(fd, tid, Ack::FailedToRead);
    }
    ctx.cpu_context.parse_regs(&regs);
    put_ack(fd, Ack::ReadContext);

    let _ = await_ack(fd, Ack::ModifiedContext);
    ctx.cpu_context.unparse_regs(&mut regs);
    if unsafe { regs::set_regs(tid, &regs) } < 0 {
        return bail(fd, tid, Ack::FailedToWrite);
    }

    if unsafe {
        sys::ptrace(
            libc::PTRACE_DETACH as usize,
            tid,
            0,
            libc::SIGCONT as usize,
        )
    } < 0
    {
        put_ack(fd, Ack::FailedToDetach);
        return 0;
    }

    put_ack(fd, Ack::WroteContext);
    0
}

/// Best-effort detach, then the failure ack.
fn bail(fd: libc::c_int, tid: ThreadId, ack: Ack) -> i32 {
    unsafe {
        sys::ptrace(
            libc::PTRACE_DETACH as usize,
            tid,
            0,
            libc::SIGCONT as usize,
        );
    }
    put_ack(fd, ack);
    0
}

fn await_ack(fd: libc::c_int, expected: Ack) -> bool {
    let mut value: u8 = 0;
    let res = unsafe { sys::read(fd, &mut value, 1) };
    res == 1 && value == expected as u8
}

fn put_ack(fd: libc::c_int, ack: Ack) {
    let value = ack as u8;
    unsafe {
        sys::write(fd, &value, 1);
    }
}
