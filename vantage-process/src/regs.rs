/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! CPU register bundles and the ptrace plumbing to move them.
//!
//! [`Regs`] is the kernel's per-architecture layout; [`CpuContext`] is the
//! stable view handed to thread-modification callbacks. Parsing and
//! unparsing mutate an existing [`Regs`] value, so kernel fields the
//! context does not model (segment selectors, `orig_rax`, `tpidr`) pass
//! through a modify round trip untouched.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::sys;

/// The general-purpose register file as exposed by ptrace.
pub use libc::user_regs_struct as Regs;

#[cfg(target_arch = "x86_64")]
const PTRACE_GETREGS: usize = 12;
#[cfg(target_arch = "x86_64")]
const PTRACE_SETREGS: usize = 13;
// aarch64 kernels only speak the regset interface, but the classic request
// numbers still exist for the fallback path.
#[cfg(target_arch = "aarch64")]
const PTRACE_GETREGS: usize = 12;
#[cfg(target_arch = "aarch64")]
const PTRACE_SETREGS: usize = 13;

const PTRACE_GETREGSET: usize = 0x4204;
const PTRACE_SETREGSET: usize = 0x4205;

// Single transition true -> false, memoized for the process lifetime; the
// race on the first store is benign.
static REGSET_SUPPORTED: AtomicBool = AtomicBool::new(true);

/// A snapshot of one thread's CPU state.
///
/// General-purpose registers, the program counter, the stack pointer, and
/// the flags register round-trip exactly; vector registers are zeroed on
/// the context side and never written back.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CpuContext {
    pub rip: u64,
    pub rflags: u64,

    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,

    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// A snapshot of one thread's CPU state.
///
/// General-purpose registers, the program counter, the stack pointer, and
/// the NZCV flags round-trip exactly; vector registers are zeroed on the
/// context side and never written back.
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CpuContext {
    pub pc: u64,
    pub sp: u64,
    pub nzcv: u64,

    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,

    pub v: [u128; 32],
}

impl Default for CpuContext {
    fn default() -> Self {
        // Plain integer fields throughout; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

#[cfg(target_arch = "aarch64")]
const NZCV_MASK: u64 = 0xf000_0000;

impl CpuContext {
    /// Fills the context from a ptrace register bundle.
    pub fn parse_regs(&mut self, regs: &Regs) {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip = regs.rip;
            self.rflags = regs.eflags;

            self.r15 = regs.r15;
            self.r14 = regs.r14;
            self.r13 = regs.r13;
            self.r12 = regs.r12;
            self.r11 = regs.r11;
            self.r10 = regs.r10;
            self.r9 = regs.r9;
            self.r8 = regs.r8;

            self.rdi = regs.rdi;
            self.rsi = regs.rsi;
            self.rbp = regs.rbp;
            self.rsp = regs.rsp;
            self.rbx = regs.rbx;
            self.rdx = regs.rdx;
            self.rcx = regs.rcx;
            self.rax = regs.rax;
        }

        #[cfg(target_arch = "aarch64")]
        {
            self.pc = regs.pc;
            self.sp = regs.sp;
            self.nzcv = regs.pstate & NZCV_MASK;

            self.x.copy_from_slice(&regs.regs[..29]);
            self.fp = regs.regs[29];
            self.lr = regs.regs[30];

            self.v = [0; 32];
        }
    }

    /// Writes the context back into a ptrace register bundle.
    pub fn unparse_regs(&self, regs: &mut Regs) {
        #[cfg(target_arch = "x86_64")]
        {
            regs.rip = self.rip;
            regs.eflags = self.rflags;

            regs.r15 = self.r15;
            regs.r14 = self.r14;
            regs.r13 = self.r13;
            regs.r12 = self.r12;
            regs.r11 = self.r11;
            regs.r10 = self.r10;
            regs.r9 = self.r9;
            regs.r8 = self.r8;

            regs.rdi = self.rdi;
            regs.rsi = self.rsi;
            regs.rbp = self.rbp;
            regs.rsp = self.rsp;
            regs.rbx = self.rbx;
            regs.rdx = self.rdx;
            regs.rcx = self.rcx;
            regs.rax = self.rax;
        }

        #[cfg(target_arch = "aarch64")]
        {
            regs.pc = self.pc;
            regs.sp = self.sp;
            regs.pstate = (regs.pstate & !NZCV_MASK) | (self.nzcv & NZCV_MASK);

            regs.regs[..29].copy_from_slice(&self.x);
            regs.regs[29] = self.fp;
            regs.regs[30] = self.lr;
        }
    }

    /// Fills the context from a signal-delivery `ucontext_t`.
    #[cfg(target_env = "gnu")]
    pub fn parse_ucontext(&mut self, uc: &libc::ucontext_t) {
        #[cfg(target_arch = "x86_64")]
        {
            let gr = &uc.uc_mcontext.gregs;

            self.rip = gr[libc::REG_RIP as usize] as u64;
            self.rflags = gr[libc::REG_EFL as usize] as u64;

            self.r15 = gr[libc::REG_R15 as usize] as u64;
            self.r14 = gr[libc::REG_R14 as usize] as u64;
            self.r13 = gr[libc::REG_R13 as usize] as u64;
            self.r12 = gr[libc::REG_R12 as usize] as u64;
            self.r11 = gr[libc::REG_R11 as usize] as u64;
            self.r10 = gr[libc::REG_R10 as usize] as u64;
            self.r9 = gr[libc::REG_R9 as usize] as u64;
            self.r8 = gr[libc::REG_R8 as usize] as u64;

            self.rdi = gr[libc::REG_RDI as usize] as u64;
            self.rsi = gr[libc::REG_RSI as usize] as u64;
            self.rbp = gr[libc::REG_RBP as usize] as u64;
            self.rsp = gr[libc::REG_RSP as usize] as u64;
            self.rbx = gr[libc::REG_RBX as usize] as u64;
            self.rdx = gr[libc::REG_RDX as usize] as u64;
            self.rcx = gr[libc::REG_RCX as usize] as u64;
            self.rax = gr[libc::REG_RAX as usize] as u64;
        }

        #[cfg(target_arch = "aarch64")]
        {
            let mc = &uc.uc_mcontext;

            self.pc = mc.pc;
            self.sp = mc.sp;
            self.nzcv = mc.pstate & NZCV_MASK;

            self.x.copy_from_slice(&mc.regs[..29]);
            self.fp = mc.regs[29];
            self.lr = mc.regs[30];

            self.v = [0; 32];
        }
    }

    /// Writes the context back into a signal-delivery `ucontext_t`.
    #[cfg(target_env = "gnu")]
    pub fn unparse_ucontext(&self, uc: &mut libc::ucontext_t) {
        #[cfg(target_arch = "x86_64")]
        {
            let gr = &mut uc.uc_mcontext.gregs;

            gr[libc::REG_RIP as usize] = self.rip as i64;
            gr[libc::REG_EFL as usize] = self.rflags as i64;

            gr[libc::REG_R15 as usize] = self.r15 as i64;
            gr[libc::REG_R14 as usize] = self.r14 as i64;
            gr[libc::REG_R13 as usize] = self.r13 as i64;
            gr[libc::REG_R12 as usize] = self.r12 as i64;
            gr[libc::REG_R11 as usize] = self.r11 as i64;
            gr[libc::REG_R10 as usize] = self.r10 as i64;
            gr[libc::REG_R9 as usize] = self.r9 as i64;
            gr[libc::REG_R8 as usize] = self.r8 as i64;

            gr[libc::REG_RDI as usize] = self.rdi as i64;
            gr[libc::REG_RSI as usize] = self.rsi as i64;
            gr[libc::REG_RBP as usize] = self.rbp as i64;
            gr[libc::REG_RSP as usize] = self.rsp as i64;
            gr[libc::REG_RBX as usize] = self.rbx as i64;
            gr[libc::REG_RDX as usize] = self.rdx as i64;
            gr[libc::REG_RCX as usize] = self.rcx as i64;
            gr[libc::REG_RAX as usize] = self.rax as i64;
        }

        #[cfg(target_arch = "aarch64")]
        {
            let mc = &mut uc.uc_mcontext;

            mc.pc = self.pc;
            mc.sp = self.sp;
            mc.pstate = (mc.pstate & !NZCV_MASK) | (self.nzcv & NZCV_MASK);

            mc.regs[..29].copy_from_slice(&self.x);
            mc.regs[29] = self.fp;
            mc.regs[30] = self.lr;
        }
    }

    /// The instruction pointer.
    pub fn pc(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.pc
        }
    }

    /// The stack pointer.
    pub fn sp(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.rsp
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.sp
        }
    }
}

/// Reads `pid`'s registers, preferring the regset interface.
///
/// Runs in the helper task: raw syscalls only, no allocation. Returns the
/// raw kernel value.
pub(crate) unsafe fn get_regs(pid: libc::pid_t, regs: &mut Regs) -> isize {
    if REGSET_SUPPORTED.load(Ordering::Relaxed) {
        let mut iov = libc::iovec {
            iov_base: regs as *mut Regs as *mut libc::c_void,
            iov_len: core::mem::size_of::<Regs>(),
        };
        let ret = sys::ptrace(
            PTRACE_GETREGSET,
            pid,
            libc::NT_PRSTATUS as usize,
            &mut iov as *mut libc::iovec as usize,
        );
        if ret >= 0 || ret == -(libc::EPERM as isize) || ret == -(libc::ESRCH as isize) {
            return ret;
        }
        REGSET_SUPPORTED.store(false, Ordering::Relaxed);
    }

    sys::ptrace(PTRACE_GETREGS, pid, 0, regs as *mut Regs as usize)
}

/// Writes `pid`'s registers, preferring the regset interface.
pub(crate) unsafe fn set_regs(pid: libc::pid_t, regs: &Regs) -> isize {
    if REGSET_SUPPORTED.load(Ordering::Relaxed) {
        let mut iov = libc::iovec {
            iov_base: regs as *const Regs as *mut libc::c_void,
            iov_len: core::mem::size_of::<Regs>(),
        };
        let ret = sys::ptrace(
            PTRACE_SETREGSET,
            pid,
            libc::NT_PRSTATUS as usize,
            &mut iov as *mut libc::iovec as usize,
        );
        if ret >= 0 || ret == -(libc::EPERM as isize) || ret == -(libc::ESRCH as isize) {
            return ret;
        }
        REGSET_SUPPORTED.store(false, Ordering::Relaxed);
    }

    sys::ptrace(PTRACE_SETREGS, pid, 0, regs as *const Regs as usize)
}
