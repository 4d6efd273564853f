/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thread enumeration and control for the current process.

use std::fs;

use syscalls::syscall;
use syscalls::Sysno;

use crate::modify::modify_thread;
use crate::regs::CpuContext;
use crate::Error;
use crate::MemoryRange;

/// A native thread id, as returned by `gettid`.
pub type ThreadId = libc::pid_t;

/// Scheduling state of a thread, derived from its procfs stat character.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    /// On a run queue (`R`).
    Running,
    /// In an interruptible sleep (`S`).
    Waiting,
    /// Stopped by a signal or tracer (`T`).
    Stopped,
    /// Uninterruptible sleep, zombie, or paging (`D`, `Z`, `W`).
    Uninterruptible,
    /// Never produced on Linux; present for other platforms' reporters.
    Halted,
}

/// A snapshot of one thread.
#[derive(Debug, Clone)]
pub struct ThreadDetails {
    /// The thread's id.
    pub id: ThreadId,
    /// The thread's name, when one could be read.
    pub name: Option<String>,
    /// Scheduling state at snapshot time.
    pub state: ThreadState,
    /// Register state at snapshot time.
    pub cpu_context: CpuContext,
}

/// The current thread's id.
pub fn current_thread_id() -> ThreadId {
    // Always succeeds.
    unsafe { syscall!(Sysno::gettid) }.unwrap_or_default() as ThreadId
}

/// Whether `thread_id` names a live thread of this process.
pub fn has_thread(thread_id: ThreadId) -> bool {
    fs::metadata(format!("/proc/self/task/{}", thread_id)).is_ok()
}

/// Enumerates this process's threads, stopping early when `func` returns
/// `false`.
///
/// The listing is a snapshot of `/proc/self/task`; threads created during
/// enumeration may or may not appear. Threads whose state cannot be read
/// or whose context cannot be captured are skipped.
pub fn enumerate_threads<F>(mut func: F)
where
    F: FnMut(&ThreadDetails) -> bool,
{
    let entries = match fs::read_dir("/proc/self/task") {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let id: ThreadId = match entry.file_name().to_string_lossy().parse() {
            Ok(id) => id,
            Err(_) => continue,
        };

        let state = match read_thread_state(id) {
            Some(state) => state,
            None => continue,
        };

        let mut cpu_context = CpuContext::default();
        if !modify_thread(id, |ctx| cpu_context = *ctx) {
            continue;
        }

        let details = ThreadDetails {
            id,
            name: read_thread_name(id),
            state,
            cpu_context,
        };

        if !func(&details) {
            break;
        }
    }
}

fn read_thread_name(thread_id: ThreadId) -> Option<String> {
    let comm = fs::read_to_string(format!("/proc/self/task/{}/comm", thread_id)).ok()?;
    Some(comm.trim_end_matches('\n').to_owned())
}

pub(crate) fn read_thread_state(thread_id: ThreadId) -> Option<ThreadState> {
    let stat = fs::read_to_string(format!("/proc/self/task/{}/stat", thread_id)).ok()?;

    // The state character is the first one past the last ')'; anything
    // before that may be part of the comm field.
    let tail = &stat[stat.rfind(')')? + 2..];
    tail.chars().next().map(thread_state_from_stat_character)
}

fn thread_state_from_stat_character(c: char) -> ThreadState {
    match c.to_ascii_uppercase() {
        'R' => ThreadState::Running,
        'S' => ThreadState::Waiting,
        'T' => ThreadState::Stopped,
        'D' | 'Z' | 'W' => ThreadState::Uninterruptible,
        _ => ThreadState::Uninterruptible,
    }
}

/// Stops `thread_id` with `SIGSTOP`.
pub fn thread_suspend(thread_id: ThreadId) -> Result<(), Error> {
    let pid = unsafe { libc::getpid() };
    unsafe { syscall!(Sysno::tgkill, pid, thread_id, libc::SIGSTOP) }
        .map(drop)
        .map_err(Error::Failed)
}

/// Resumes `thread_id` with `SIGCONT`.
pub fn thread_resume(thread_id: ThreadId) -> Result<(), Error> {
    let pid = unsafe { libc::getpid() };
    unsafe { syscall!(Sysno::tgkill, pid, thread_id, libc::SIGCONT) }
        .map(drop)
        .map_err(Error::Failed)
}

/// Whether a tracer is currently attached to this process.
pub fn is_debugger_attached() -> bool {
    let status = match fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(_) => return false,
    };

    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|rest| rest.trim().parse::<i32>().ok())
        .map(|pid| pid != 0)
        .unwrap_or(false)
}

/// Reports the current thread's stack range, when the pthread runtime
/// exposes it. Returns at most `max_length` ranges.
pub fn current_thread_ranges(max_length: usize) -> Vec<MemoryRange> {
    let mut ranges = Vec::new();
    if max_length == 0 {
        return ranges;
    }

    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return ranges;
        }

        let mut stack_addr: *mut libc::c_void = core::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        if libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size) == 0 {
            ranges.push(MemoryRange {
                base_address: stack_addr as u64,
                size: stack_size as u64,
            });
        }

        libc::pthread_attr_destroy(&mut attr);
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_thread_exists() {
        let tid = current_thread_id();
        assert!(tid > 0);
        assert!(has_thread(tid));
        assert!(!has_thread(-1));
    }

    #[test]
    fn current_thread_state_is_running() {
        assert_eq!(
            read_thread_state(current_thread_id()),
            Some(ThreadState::Running)
        );
    }

    #[test]
    fn stat_characters_map() {
        assert_eq!(thread_state_from_stat_character('R'), ThreadState::Running);
        assert_eq!(thread_state_from_stat_character('S'), ThreadState::Waiting);
        assert_eq!(thread_state_from_stat_character('T'), ThreadState::Stopped);
        assert_eq!(
            thread_state_from_stat_character('D'),
            ThreadState::Uninterruptible
        );
        // Zombies fold into the same bucket.
        assert_eq!(
            thread_state_from_stat_character('Z'),
            ThreadState::Uninterruptible
        );
    }

    #[test]
    fn no_debugger_under_normal_test_runs() {
        // The test harness is not a tracer.
        assert!(!is_debugger_attached());
    }

    #[test]
    fn own_stack_range_covers_a_local() {
        let ranges = current_thread_ranges(1);
        assert_eq!(ranges.len(), 1);
        let local = 0u64;
        let here = &local as *const u64 as u64;
        assert!(ranges[0].includes(here));
    }
}
