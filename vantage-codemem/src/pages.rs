/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Anonymous page mapping, near-address placement, and cache maintenance.

use lazy_static::lazy_static;
use nix::sys::mman::ProtFlags;
use syscalls::Errno;
use vantage_process::page_size;

use crate::AddressSpec;

lazy_static! {
    static ref RWX_SUPPORTED: bool = probe_rwx();
}

/// Whether this host allows simultaneously writable and executable pages.
pub fn rwx_supported() -> bool {
    *RWX_SUPPORTED
}

fn probe_rwx() -> bool {
    let size = page_size();
    let page = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if page == libc::MAP_FAILED {
        return false;
    }
    unsafe {
        libc::munmap(page, size);
    }
    true
}

/// An owned span of mapped pages.
pub(crate) struct PageAlloc {
    ptr: *mut u8,
    size: usize,
}

impl PageAlloc {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }
}

impl Drop for PageAlloc {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Maps `count` anonymous pages with `prot`.
pub(crate) fn alloc_pages(count: usize, prot: ProtFlags) -> Result<PageAlloc, Errno> {
    let size = count * page_size();
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            prot.bits(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    Ok(PageAlloc {
        ptr: ptr as *mut u8,
        size,
    })
}

/// Maps `count` anonymous pages with both endpoints inside the window
/// described by `spec`.
pub(crate) fn try_alloc_pages_near(
    count: usize,
    prot: ProtFlags,
    spec: &AddressSpec,
) -> Option<PageAlloc> {
    let size = count * page_size();
    let ptr = unsafe {
        map_near(
            size,
            prot.bits(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            spec,
        )
    }?;
    Some(PageAlloc { ptr, size })
}

/// Sweeps hint addresses across the window until the kernel places a
/// mapping whose whole span stays inside it.
pub(crate) unsafe fn map_near(
    size: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: libc::c_int,
    spec: &AddressSpec,
) -> Option<*mut u8> {
    let page = page_size();
    let align_up = |value: usize| (value + page - 1) & !(page - 1);

    let lo = align_up(spec.near_address.saturating_sub(spec.max_distance)).max(page);
    let hi = spec
        .near_address
        .saturating_add(spec.max_distance)
        .checked_sub(size)?
        & !(page - 1);
    if hi < lo {
        return None;
    }

    const ATTEMPTS: usize = 128;
    let step = align_up(((hi - lo) / ATTEMPTS).max(page));

    let mut hint = lo;
    while hint <= hi {
        let ptr = libc::mmap(
            hint as *mut libc::c_void,
            size,
            prot,
            flags | libc::MAP_FIXED_NOREPLACE,
            fd,
            0,
        );
        if ptr != libc::MAP_FAILED {
            let addr = ptr as usize;
            if addr >= lo && addr <= hi {
                return Some(ptr as *mut u8);
            }
            // A kernel that ignores MAP_FIXED_NOREPLACE placed us
            // anywhere it liked; no point sweeping further.
            libc::munmap(ptr, size);
            return None;
        }
        hint += step;
    }

    None
}

/// Changes the protection of the pages covering `[address, address+size)`.
pub(crate) unsafe fn protect(address: *mut u8, size: usize, prot: ProtFlags) -> Result<(), Errno> {
    let page = page_size();
    let start = (address as usize) & !(page - 1);
    let end = (address as usize)
        .checked_add(size)
        .map(|end| (end + page - 1) & !(page - 1))
        .ok_or(Errno::EINVAL)?;

    Errno::result(libc::mprotect(
        start as *mut libc::c_void,
        end - start,
        prot.bits(),
    ))
    .map(drop)
}

/// Flushes the instruction cache over freshly written code.
///
/// x86 keeps its caches coherent; aarch64 needs the compiler-rt builtin.
pub(crate) fn clear_cache(address: *mut u8, size: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let _ = (address, size);
    }

    #[cfg(target_arch = "aarch64")]
    {
        extern "C" {
            fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
        }
        unsafe {
            __clear_cache(
                address as *mut libc::c_char,
                address.add(size) as *mut libc::c_char,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_pages_are_zeroed_and_writable() {
        let pages = alloc_pages(2, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE).unwrap();
        assert_eq!(pages.len(), 2 * page_size());
        unsafe {
            assert_eq!(*pages.as_ptr(), 0);
            pages.as_ptr().write(0xaa);
            assert_eq!(*pages.as_ptr(), 0xaa);
        }
    }

    #[test]
    fn near_allocation_lands_in_window() {
        // Anchor the window at a fresh mapping so there's free space
        // around it.
        let anchor = alloc_pages(1, ProtFlags::PROT_READ).unwrap();
        let spec = AddressSpec {
            near_address: anchor.as_ptr() as usize,
            max_distance: 128 * 1024 * 1024,
        };

        let pages =
            try_alloc_pages_near(1, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, &spec).unwrap();
        let start = pages.as_ptr() as usize;
        let end = start + pages.len() - 1;
        assert!(start.abs_diff(spec.near_address) <= spec.max_distance);
        assert!(end.abs_diff(spec.near_address) <= spec.max_distance);
    }
}
