/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Executable slabs for hosts that enforce W^X.
//!
//! A segment is a memfd whose pages appear at their final address as a
//! `MAP_SHARED` writable view while code is being assembled; [`CodeSegment::map`]
//! then remaps the same pages read+execute in place. At no point is the
//! memory both writable and executable.

use nix::sys::mman::ProtFlags;
use syscalls::Errno;

use crate::pages;
use crate::AddressSpec;

/// A memfd-backed slab of code pages.
pub struct CodeSegment {
    fd: libc::c_int,
    address: *mut u8,
    size: usize,
}

impl CodeSegment {
    /// Creates a segment of `size` bytes, placed inside `spec`'s window
    /// when one is given.
    pub fn new(size: usize, spec: Option<&AddressSpec>) -> Result<CodeSegment, Errno> {
        let name = b"code-segment\0";
        let fd = unsafe {
            libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(Errno::last());
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = Errno::last();
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }

        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let address = match spec {
            Some(spec) => unsafe { pages::map_near(size, prot, libc::MAP_SHARED, fd, spec) },
            None => {
                let ptr = unsafe {
                    libc::mmap(
                        core::ptr::null_mut(),
                        size,
                        prot,
                        libc::MAP_SHARED,
                        fd,
                        0,
                    )
                };
                (ptr != libc::MAP_FAILED).then_some(ptr as *mut u8)
            }
        };

        match address {
            Some(address) => Ok(CodeSegment { fd, address, size }),
            None => {
                unsafe {
                    libc::close(fd);
                }
                Err(Errno::ENOMEM)
            }
        }
    }

    /// The address code runs from, which is also where it is written.
    pub fn address(&self) -> *mut u8 {
        self.address
    }

    /// The mapped size.
    pub fn virtual_size(&self) -> usize {
        self.size
    }

    /// Materializes any backing state ahead of [`CodeSegment::map`]. A
    /// plain memfd has nothing to do here; the seam exists for backings
    /// that need a separate sealing step.
    pub fn realize(&self) -> Result<(), Errno> {
        Ok(())
    }

    /// Replaces the writable view with a read+execute mapping of the same
    /// pages, at the same address.
    pub fn map(&self) -> Result<(), Errno> {
        let ptr = unsafe {
            libc::mmap(
                self.address as *mut libc::c_void,
                self.size,
                ProtFlags::PROT_READ.bits() | ProtFlags::PROT_EXEC.bits(),
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        Ok(())
    }
}

impl Drop for CodeSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.address as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_round_trip() {
        let segment = CodeSegment::new(vantage_process::page_size(), None).unwrap();
        let data = segment.address();

        // Writable before map.
        unsafe {
            data.write(0x42);
            assert_eq!(*data, 0x42);
        }

        segment.realize().unwrap();
        segment.map().unwrap();

        // Content survives the remap.
        unsafe {
            assert_eq!(*data, 0x42);
        }
    }
}
