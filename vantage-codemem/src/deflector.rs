/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Code deflectors: (return-address -> target) rewrites installed in ELF
//! padding bytes.
//!
//! Allocating a whole executable page within short-branch reach of an
//! arbitrary caller is usually impossible under ASLR, but every mapped ELF
//! image carries a few guaranteed-zero padding bytes right after its
//! ident. One such "cave" hosts a branch to a thunk page, and the thunk
//! resolves the caller by return address through a dispatcher shared by
//! every deflector whose reach window covers that cave.

use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

use nix::sys::mman::ProtFlags;
use tracing::debug;
use vantage_process::enumerate_ranges;
use vantage_process::Protection;

use crate::emit;
use crate::pages;
use crate::pages::PageAlloc;
use crate::AddressSpec;
use crate::CodeAllocator;

const CAVE_SIZE: usize = 8;
// The probe slot sits right after the ELF ident's ABI-version byte.
const CAVE_OFFSET: usize = 8;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// A caller-site rewrite: branches to [`CodeDeflector::trampoline`] whose
/// return address equals [`CodeDeflector::return_address`] land on
/// [`CodeDeflector::target`].
pub struct CodeDeflector {
    /// The return address this deflector matches.
    pub return_address: usize,
    /// Where matching calls are diverted to.
    pub target: usize,
    /// The address the caller site should branch to.
    pub trampoline: usize,

    entry: *mut CallerEntry,
}

#[repr(C)]
struct CallerEntry {
    return_address: usize,
    target: usize,
    next: *mut CallerEntry,
}

/// The state the emitted thunk hands to [`dispatcher_lookup`]. Boxed so
/// its address stays stable for the lifetime of the dispatcher.
#[repr(C)]
pub(crate) struct DispatcherShared {
    head: AtomicPtr<CallerEntry>,
}

/// Resolves a caller by exact return-address match.
///
/// Runs on arbitrary threads at call time: no allocation, no blocking,
/// reentrant. Returns 0 when no deflector matches.
pub(crate) extern "C" fn dispatcher_lookup(
    dispatcher: *const DispatcherShared,
    return_address: usize,
) -> usize {
    let mut cursor = unsafe { (*dispatcher).head.load(Ordering::Acquire) };
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        if entry.return_address == return_address {
            return entry.target;
        }
        cursor = entry.next;
    }
    0
}

pub(crate) struct Dispatcher {
    shared: Box<DispatcherShared>,

    cave_address: *mut u8,
    trampoline: usize,
    original_bytes: [u8; CAVE_SIZE],

    #[allow(dead_code)]
    thunk: PageAlloc,
}

impl Dispatcher {
    fn new(caller: &AddressSpec) -> Option<Dispatcher> {
        let cave_address = find_code_cave(caller)?;
        debug!(cave = cave_address as usize, "patching code cave");

        let thunk = pages::try_alloc_pages_near(
            1,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            &AddressSpec::new(cave_address as usize, emit::CAVE_BRANCH_REACH),
        )?;

        let shared = Box::new(DispatcherShared {
            head: AtomicPtr::new(core::ptr::null_mut()),
        });

        let thunk_len = unsafe {
            let body = core::slice::from_raw_parts_mut(thunk.as_ptr(), thunk.len());
            emit::emit_dispatcher_thunk(
                body,
                &*shared as *const DispatcherShared as usize,
                dispatcher_lookup as usize,
            )
        };

        let mut original_bytes = [0u8; CAVE_SIZE];
        unsafe {
            core::ptr::copy_nonoverlapping(cave_address, original_bytes.as_mut_ptr(), CAVE_SIZE);
        }

        let mut patch = [0u8; CAVE_SIZE];
        emit::emit_cave_branch(&mut patch, cave_address as usize, thunk.as_ptr() as usize);

        unsafe {
            ensure_rw(cave_address).ok()?;
            core::ptr::copy_nonoverlapping(patch.as_ptr(), cave_address, CAVE_SIZE);
            ensure_rx(cave_address).ok()?;
        }
        pages::clear_cache(cave_address, CAVE_SIZE);

        unsafe {
            pages::protect(
                thunk.as_ptr(),
                thunk.len(),
                ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            )
            .ok()?;
        }
        pages::clear_cache(thunk.as_ptr(), thunk_len);

        Some(Dispatcher {
            shared,
            cave_address,
            trampoline: cave_address as usize,
            original_bytes,
            thunk,
        })
    }

    fn contains(&self, entry: *mut CallerEntry) -> bool {
        let mut cursor = self.shared.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            if cursor == entry {
                return true;
            }
            cursor = unsafe { (*cursor).next };
        }
        false
    }

    /// Prepends an entry. External serialization required; concurrent
    /// lookups observe either list state.
    fn push(&mut self, return_address: usize, target: usize) -> *mut CallerEntry {
        let entry = Box::into_raw(Box::new(CallerEntry {
            return_address,
            target,
            next: self.shared.head.load(Ordering::Relaxed),
        }));
        self.shared.head.store(entry, Ordering::Release);
        entry
    }

    fn remove(&mut self, entry: *mut CallerEntry) {
        let mut cursor = self.shared.head.load(Ordering::Relaxed);

        if cursor == entry {
            self.shared
                .head
                .store(unsafe { (*entry).next }, Ordering::Release);
            drop(unsafe { Box::from_raw(entry) });
            return;
        }

        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            if next == entry {
                unsafe {
                    (*cursor).next = (*entry).next;
                    drop(Box::from_raw(entry));
                }
                return;
            }
            cursor = next;
        }
    }

    fn is_empty(&self) -> bool {
        self.shared.head.load(Ordering::Relaxed).is_null()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Put the cave back byte for byte.
        unsafe {
            if ensure_rw(self.cave_address).is_ok() {
                core::ptr::copy_nonoverlapping(
                    self.original_bytes.as_ptr(),
                    self.cave_address,
                    CAVE_SIZE,
                );
                let _ = ensure_rx(self.cave_address);
                pages::clear_cache(self.cave_address, CAVE_SIZE);
            }
        }

        let mut cursor = self.shared.head.swap(core::ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            let entry = unsafe { Box::from_raw(cursor) };
            cursor = entry.next;
        }
    }
}

unsafe fn ensure_rw(cave_address: *mut u8) -> Result<(), syscalls::Errno> {
    let prot = if pages::rwx_supported() {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC
    } else {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
    };
    pages::protect(cave_address, CAVE_SIZE, prot)
}

unsafe fn ensure_rx(cave_address: *mut u8) -> Result<(), syscalls::Errno> {
    pages::protect(
        cave_address,
        CAVE_SIZE,
        ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
    )
}

/// Finds the first readable+executable mapping that is an ELF image with
/// an all-zero 8-byte slot after its ident, within reach of `caller`.
fn find_code_cave(caller: &AddressSpec) -> Option<*mut u8> {
    let mut cave = None;

    enumerate_ranges(Protection::READ | Protection::EXECUTE, |details| {
        let base = details.range.base_address as usize;
        let candidate = base + CAVE_OFFSET;

        if candidate.abs_diff(caller.near_address) > caller.max_distance {
            return true;
        }

        let head = unsafe { core::slice::from_raw_parts(base as *const u8, CAVE_OFFSET + CAVE_SIZE) };
        if head[..4] != ELF_MAGIC {
            return true;
        }
        if head[CAVE_OFFSET..].iter().any(|&b| b != 0) {
            return true;
        }

        cave = Some(candidate as *mut u8);
        false
    });

    cave
}

impl CodeAllocator {
    /// Installs a deflector so that calls through the returned trampoline
    /// whose return address equals `return_address` divert to `target`.
    ///
    /// Dispatchers are shared: one cave within `caller`'s window serves
    /// every deflector whose window overlaps it. Returns `None` when no
    /// suitable cave exists.
    pub fn alloc_deflector(
        &mut self,
        caller: &AddressSpec,
        return_address: usize,
        target: usize,
    ) -> Option<CodeDeflector> {
        let index = match self.dispatchers.iter().position(|dispatcher| {
            (dispatcher.cave_address as usize).abs_diff(caller.near_address)
                <= caller.max_distance
        }) {
            Some(index) => index,
            None => {
                self.dispatchers.push(Dispatcher::new(caller)?);
                self.dispatchers.len() - 1
            }
        };

        let dispatcher = &mut self.dispatchers[index];
        let entry = dispatcher.push(return_address, target);

        Some(CodeDeflector {
            return_address,
            target,
            trampoline: dispatcher.trampoline,
            entry,
        })
    }

    /// Tears down a deflector. When the last deflector of a dispatcher
    /// goes away, the dispatcher is destroyed and its cave bytes restored.
    ///
    /// No call may be in flight through the dispatcher when its last
    /// deflector is freed.
    pub fn free_deflector(&mut self, deflector: CodeDeflector) {
        let index = match self
            .dispatchers
            .iter()
            .position(|dispatcher| dispatcher.contains(deflector.entry))
        {
            Some(index) => index,
            None => return,
        };

        let dispatcher = &mut self.dispatchers[index];
        dispatcher.remove(deflector.entry);
        if dispatcher.is_empty() {
            self.dispatchers.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_exact_return_address() {
        let shared = Box::new(DispatcherShared {
            head: AtomicPtr::new(core::ptr::null_mut()),
        });

        let mut entries = [
            CallerEntry {
                return_address: 0x1000,
                target: 0xaaaa,
                next: core::ptr::null_mut(),
            },
            CallerEntry {
                return_address: 0x2000,
                target: 0xbbbb,
                next: core::ptr::null_mut(),
            },
        ];
        entries[1].next = &mut entries[0];
        shared.head.store(&mut entries[1], Ordering::Release);

        let dispatcher = &*shared as *const DispatcherShared;
        assert_eq!(dispatcher_lookup(dispatcher, 0x1000), 0xaaaa);
        assert_eq!(dispatcher_lookup(dispatcher, 0x2000), 0xbbbb);
        assert_eq!(dispatcher_lookup(dispatcher, 0x3000), 0);

        shared.head.store(core::ptr::null_mut(), Ordering::Release);
    }
}
