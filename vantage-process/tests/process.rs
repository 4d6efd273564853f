/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end scenarios exercising live process state.

use std::ffi::CString;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use vantage_process::*;

use lazy_static::lazy_static;

lazy_static! {
    // Tests that stop threads or attach to them serialize here so they
    // don't observe each other's stops.
    static ref PROCESS_WIDE: Mutex<()> = Mutex::new(());
}

#[test]
fn program_modules_scenario() {
    let modules = query_program_modules();

    // Test binaries are dynamically linked.
    assert_eq!(modules.rtld, RuntimeLinker::Shared);

    let program = &modules.program;
    assert!(program.path.starts_with('/'));
    assert_ne!(program.range.size, 0);

    let interpreter = modules.interpreter.as_ref().expect("ld.so is mapped");
    assert!(interpreter.path.starts_with('/'));

    // Program and interpreter occupy disjoint ranges.
    let p = program.range;
    let i = interpreter.range;
    assert!(
        p.base_address + p.size <= i.base_address || i.base_address + i.size <= p.base_address
    );

    let vdso = modules.vdso.as_ref().expect("vdso is mapped");
    assert_eq!(vdso.path, "linux-vdso.so.1");
    assert_eq!(vdso.name, "linux-vdso.so.1");
}

#[test]
fn maps_enumeration_matches_documented_filter() {
    // Build the expected module set from procfs, applying the documented
    // filter: readable, private, ELF magic at base, absolute path or the
    // translated vDSO, not under /dev/, consecutive same-path sub-ranges
    // merged.
    let maps = procfs::process::Process::myself()
        .and_then(|p| p.maps())
        .unwrap();

    let name_of = |map: &procfs::process::MemoryMap| -> Option<String> {
        match &map.pathname {
            procfs::process::MMapPath::Path(path) => {
                Some(path.to_string_lossy().into_owned())
            }
            procfs::process::MMapPath::Vdso => Some("linux-vdso.so.1".to_owned()),
            _ => None,
        }
    };

    let mut expected = std::collections::BTreeSet::new();
    let mut current: Option<String> = None;
    for map in &maps {
        let name = match name_of(map) {
            Some(name) => name,
            None => continue,
        };
        if current.as_deref() == Some(&name) {
            continue;
        }
        current = Some(name.clone());

        let readable = map.perms.starts_with('r');
        let shared = map.perms.as_bytes().get(3) == Some(&b's');
        if !readable || shared {
            continue;
        }
        if (!name.starts_with('/') && name != "linux-vdso.so.1") || name.starts_with("/dev/") {
            continue;
        }
        let magic = unsafe { core::slice::from_raw_parts(map.address.0 as *const u8, 4) };
        if magic != b"\x7fELF" {
            continue;
        }

        expected.insert((name, map.address.0));
    }

    let mut actual = std::collections::BTreeSet::new();
    enumerate_modules_from_maps(|m| {
        actual.insert((m.path.clone(), m.range.base_address));
        true
    });

    assert_eq!(actual, expected);
}

fn spawn_busy_thread() -> (ThreadId, std::sync::Arc<AtomicBool>, thread::JoinHandle<()>) {
    let stop = std::sync::Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        tx.send(current_thread_id()).unwrap();
        while !stop2.load(Ordering::Relaxed) {
            core::hint::spin_loop();
        }
    });
    let tid = rx.recv().unwrap();
    (tid, stop, handle)
}

#[test]
fn modify_missing_thread_fails() {
    let _guard = PROCESS_WIDE.lock().unwrap();
    assert!(!modify_thread(0x7fff_fffe, |_| {}));
}

#[test]
fn modify_busy_thread_succeeds() {
    let _guard = PROCESS_WIDE.lock().unwrap();
    let (tid, stop, handle) = spawn_busy_thread();

    let mut pc = 0;
    assert!(modify_thread(tid, |ctx| pc = ctx.pc()));
    assert_ne!(pc, 0);

    // The spinning code is somewhere executable.
    let mut in_executable = false;
    enumerate_ranges(Protection::EXECUTE, |details| {
        if details.range.includes(pc) {
            in_executable = true;
            return false;
        }
        true
    });
    assert!(in_executable);

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn modify_current_thread_runs_callback() {
    if cfg!(target_env = "gnu") {
        let mut ran = false;
        assert!(modify_thread(current_thread_id(), |ctx| {
            ran = true;
            assert_ne!(ctx.sp(), 0);
        }));
        assert!(ran);
    } else {
        assert!(!modify_thread(current_thread_id(), |_| {}));
    }
}

/// Registers of a thread parked in a long sleep are stable, which lets us
/// verify that an increment of one register sticks and every other
/// observable register rides through untouched.
#[test]
fn modify_increments_exactly_one_register() {
    let _guard = PROCESS_WIDE.lock().unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        tx.send(current_thread_id()).unwrap();
        let mut req = libc::timespec {
            tv_sec: 600,
            tv_nsec: 0,
        };
        unsafe {
            libc::nanosleep(&req, &mut req);
        }
    });
    let tid = rx.recv().unwrap();

    // Give it time to actually enter the sleep.
    thread::sleep(Duration::from_millis(100));

    let mut before = CpuContext::default();
    assert!(modify_thread(tid, |ctx| {
        before = *ctx;
        #[cfg(target_arch = "x86_64")]
        {
            ctx.r13 = ctx.r13.wrapping_add(42);
        }
        #[cfg(target_arch = "aarch64")]
        {
            ctx.x[19] = ctx.x[19].wrapping_add(42);
        }
    }));

    let mut after = CpuContext::default();
    assert!(modify_thread(tid, |ctx| {
        after = *ctx;
        // Put things back; the sleeper never notices.
        *ctx = before;
    }));

    #[cfg(target_arch = "x86_64")]
    {
        assert_eq!(after.r13, before.r13.wrapping_add(42));
        assert_eq!(after.r12, before.r12);
        assert_eq!(after.r14, before.r14);
        assert_eq!(after.r15, before.r15);
        assert_eq!(after.rbx, before.rbx);
        assert_eq!(after.rbp, before.rbp);
        assert_eq!(after.rsp, before.rsp);
        assert_eq!(after.rip, before.rip);
    }
    #[cfg(target_arch = "aarch64")]
    {
        assert_eq!(after.x[19], before.x[19].wrapping_add(42));
        for i in 20..29 {
            assert_eq!(after.x[i], before.x[i]);
        }
        assert_eq!(after.fp, before.fp);
        assert_eq!(after.sp, before.sp);
        assert_eq!(after.pc, before.pc);
    }

    drop(handle); // Still sleeping; reclaimed at process exit.
}

extern "C" fn halt_stub() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Scenario: divert a busy-looping thread to a halt stub; its counter must
/// stop advancing almost immediately.
#[test]
fn redirected_thread_stops_counting() {
    let _guard = PROCESS_WIDE.lock().unwrap();

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        tx.send(current_thread_id()).unwrap();
        loop {
            COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    });
    let tid = rx.recv().unwrap();

    let observed = COUNTER.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(50));
    assert_ne!(COUNTER.load(Ordering::Relaxed), observed);

    assert!(modify_thread(tid, |ctx| {
        #[cfg(target_arch = "x86_64")]
        {
            ctx.rip = halt_stub as usize as u64;
        }
        #[cfg(target_arch = "aarch64")]
        {
            ctx.pc = halt_stub as usize as u64;
        }
    }));

    thread::sleep(Duration::from_millis(10));
    let frozen = COUNTER.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(COUNTER.load(Ordering::Relaxed), frozen);

    // The thread spins in the stub forever; leak it.
    core::mem::forget(handle);
}

#[test]
fn enumerate_threads_finds_named_thread() {
    let _guard = PROCESS_WIDE.lock().unwrap();

    let stop = std::sync::Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let handle = thread::Builder::new()
        .name("vantage-worker".into())
        .spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

    thread::sleep(Duration::from_millis(50));

    let mut found = None;
    enumerate_threads(|details| {
        if details.name.as_deref() == Some("vantage-worker") {
            found = Some(details.clone());
            return false;
        }
        true
    });

    let details = found.expect("worker shows up in the snapshot");
    assert!(has_thread(details.id));
    assert!(matches!(
        details.state,
        ThreadState::Running | ThreadState::Waiting
    ));
    assert_ne!(details.cpu_context.sp(), 0);

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// Scenario: suspending a thread lands it in procfs state `T`.
///
/// A stop signal halts the whole thread group, so the `T` observation and
/// the subsequent `SIGCONT` come from a forked child process, which keeps
/// running while this process is stopped.
#[test]
fn suspend_stops_and_resume_restarts() {
    let _guard = PROCESS_WIDE.lock().unwrap();
    let (tid, stop, handle) = spawn_busy_thread();

    let stat_path =
        CString::new(format!("/proc/{}/task/{}/stat", process_id(), tid)).unwrap();
    let parent = process_id();

    let mut pipe_fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);

    let child = unsafe { libc::fork() };
    assert!(child >= 0);

    if child == 0 {
        // Observer child: async-signal-safe calls only from here on.
        unsafe {
            libc::close(pipe_fds[0]);

            let mut state = 0u8;
            for _ in 0..500 {
                let fd = libc::open(stat_path.as_ptr(), libc::O_RDONLY);
                if fd >= 0 {
                    let mut buf = [0u8; 256];
                    let n = libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                    libc::close(fd);
                    if n > 0 {
                        state = stat_state_character(&buf[..n as usize]);
                        if state == b'T' {
                            break;
                        }
                    }
                }
                let ts = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 2_000_000,
                };
                libc::nanosleep(&ts, core::ptr::null_mut());
            }

            libc::write(pipe_fds[1], &state as *const u8 as *const libc::c_void, 1);
            libc::kill(parent, libc::SIGCONT);
            libc::_exit(0);
        }
    }

    unsafe {
        libc::close(pipe_fds[1]);
    }

    thread_suspend(tid).unwrap();

    // This thread may be group-stopped right here; the child's SIGCONT
    // gets everything moving again.
    let mut observed = 0u8;
    let n = unsafe {
        libc::read(
            pipe_fds[0],
            &mut observed as *mut u8 as *mut libc::c_void,
            1,
        )
    };
    assert_eq!(n, 1);
    assert_eq!(observed, b'T');

    thread_resume(tid).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stat = std::fs::read_to_string(format!("/proc/self/task/{}/stat", tid)).unwrap();
        let state = stat_state_character(stat.as_bytes());
        if state == b'R' || state == b'S' {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "thread never resumed");
        thread::sleep(Duration::from_millis(5));
    }

    unsafe {
        libc::close(pipe_fds[0]);
        libc::waitpid(child, core::ptr::null_mut(), 0);
    }

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

fn stat_state_character(stat: &[u8]) -> u8 {
    let close = match stat.iter().rposition(|&b| b == b')') {
        Some(pos) => pos,
        None => return 0,
    };
    stat.get(close + 2).copied().unwrap_or(0)
}
