/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Scoped control of the process-dumpable flag.
//!
//! Some systems (notably Android on release applications) start processes
//! as non-dumpable, which blocks ptrace() from same-UID processes and can
//! block reads of `/proc/self/auxv`. Holders of the guard get a window
//! where the process is dumpable; the previous value is restored when the
//! last guard goes away.

use std::sync::Mutex;

use lazy_static::lazy_static;

struct DumpableState {
    refcount: u32,
    previous: libc::c_int,
}

lazy_static! {
    static ref DUMPABLE: Mutex<DumpableState> = Mutex::new(DumpableState {
        refcount: 0,
        previous: 0,
    });
}

/// Keeps the process dumpable for as long as it lives. Nests freely.
#[must_use = "dumpability only lasts while the guard is held"]
pub struct DumpabilityGuard(());

/// Makes the process dumpable until the returned guard is dropped.
pub fn acquire_dumpability() -> DumpabilityGuard {
    let mut state = DUMPABLE.lock().unwrap();
    state.refcount += 1;
    if state.refcount == 1 {
        state.previous = unsafe { libc::prctl(libc::PR_GET_DUMPABLE) };
        if state.previous != -1 && state.previous != 1 {
            unsafe {
                libc::prctl(libc::PR_SET_DUMPABLE, 1);
            }
        }
    }
    DumpabilityGuard(())
}

impl Drop for DumpabilityGuard {
    fn drop(&mut self) {
        let mut state = DUMPABLE.lock().unwrap();
        state.refcount -= 1;
        if state.refcount == 0 && state.previous != -1 && state.previous != 1 {
            unsafe {
                libc::prctl(libc::PR_SET_DUMPABLE, state.previous);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_restore_previous_value() {
        let before = unsafe { libc::prctl(libc::PR_GET_DUMPABLE) };

        {
            let _a = acquire_dumpability();
            assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, 1);
            {
                let _b = acquire_dumpability();
                let _c = acquire_dumpability();
                assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, 1);
            }
            assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, 1);
        }

        assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, before);
    }
}
