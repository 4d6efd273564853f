/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(rustdoc::broken_intra_doc_links)]
#![cfg(target_os = "linux")]

//! Executable memory for in-process instrumentation: page-backed slabs of
//! fixed-size code slices that can be constrained to land within branch
//! reach of a caller, plus "code deflectors" that repurpose ELF padding
//! bytes as shared trampoline dispatchers.
//!
//! Nothing in here is internally synchronized; callers serialize access to
//! an allocator. The one exception is the dispatcher lookup installed in a
//! cave, which any thread may execute concurrently.

mod deflector;
mod emit;
mod pages;
mod segment;

use std::collections::HashMap;
use std::rc::Rc;

use nix::sys::mman::ProtFlags;
use syscalls::Errno;
use vantage_process::page_size;

pub use deflector::CodeDeflector;
pub use pages::rwx_supported;
pub use segment::CodeSegment;

use deflector::Dispatcher;
use pages::PageAlloc;

/// Constrains an allocation to addresses a short branch can reach:
/// `|candidate - near_address| <= max_distance` for both ends of the
/// allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    /// The address the allocation must stay close to.
    pub near_address: usize,
    /// Maximum distance, in bytes, of either endpoint.
    pub max_distance: usize,
}

impl AddressSpec {
    /// Creates a spec for allocations within `max_distance` of `near`.
    pub fn new(near_address: usize, max_distance: usize) -> AddressSpec {
        AddressSpec {
            near_address,
            max_distance,
        }
    }
}

enum Backing {
    Pages(#[allow(dead_code)] PageAlloc),
    Segment(CodeSegment),
}

struct Block {
    data: *mut u8,
    size: usize,
    backing: Backing,
}

/// A fixed-size chunk of executable memory carved from a one-page block.
///
/// Under W^X the slice is writable until the owning allocator's
/// [`CodeAllocator::commit`] and executable afterwards; with RWX pages it
/// is both throughout.
pub struct CodeSlice {
    data: *mut u8,
    size: usize,
    block: Rc<Block>,
}

impl CodeSlice {
    /// The slice's code address.
    pub fn as_ptr(&self) -> *mut u8 {
        self.data
    }

    /// The slice size, fixed per allocator.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the slice is empty (never, for a real allocator).
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// A writable view of the slice.
    ///
    /// # Safety
    ///
    /// Only valid between allocation and the owning allocator's commit;
    /// nothing may execute the slice while it is borrowed.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.data, self.size)
    }

    fn is_near(&self, spec: Option<&AddressSpec>) -> bool {
        let spec = match spec {
            Some(spec) => spec,
            None => return true,
        };

        let start = self.data as usize;
        let end = start + self.size - 1;

        start.abs_diff(spec.near_address) <= spec.max_distance
            && end.abs_diff(spec.near_address) <= spec.max_distance
    }

    fn is_aligned(&self, alignment: usize) -> bool {
        alignment == 0 || (self.data as usize) % alignment == 0
    }
}

/// An allocator of code slices and code deflectors.
///
/// Each underlying block is a single page carved into
/// `page_size / slice_size` slices. On RWX-friendly hosts blocks are plain
/// RWX pages and freed slices are recycled through a free list; under W^X
/// blocks live in a [`CodeSegment`] and become executable at
/// [`CodeAllocator::commit`].
pub struct CodeAllocator {
    slice_size: usize,
    slices_per_page: usize,
    rwx: bool,

    free_slices: Vec<CodeSlice>,
    uncommitted: Vec<Rc<Block>>,
    dirty: HashMap<usize, Rc<Block>>,

    pub(crate) dispatchers: Vec<Dispatcher>,
}

impl CodeAllocator {
    /// Creates an allocator handing out slices of `slice_size` bytes,
    /// which must divide the page size.
    pub fn new(slice_size: usize) -> CodeAllocator {
        Self::with_policy(slice_size, pages::rwx_supported())
    }

    /// Like [`CodeAllocator::new`] with an explicit RWX decision. With
    /// `rwx` false the allocator behaves as on a W^X-enforcing host
    /// regardless of what this kernel permits.
    pub fn with_policy(slice_size: usize, rwx: bool) -> CodeAllocator {
        assert!(slice_size > 0 && page_size() % slice_size == 0);

        CodeAllocator {
            slice_size,
            slices_per_page: page_size() / slice_size,
            rwx,
            free_slices: Vec::new(),
            uncommitted: Vec::new(),
            dirty: HashMap::new(),
            dispatchers: Vec::new(),
        }
    }

    /// The number of slices carved from each page.
    pub fn slices_per_page(&self) -> usize {
        self.slices_per_page
    }

    /// Allocates a slice with no placement constraint.
    pub fn alloc_slice(&mut self) -> Option<CodeSlice> {
        self.try_alloc_slice_near(None, 0)
    }

    /// Allocates a slice whose span satisfies `spec` and whose address is
    /// `alignment`-aligned (0 for any).
    pub fn try_alloc_slice_near(
        &mut self,
        spec: Option<&AddressSpec>,
        alignment: usize,
    ) -> Option<CodeSlice> {
        if let Some(found) = self
            .free_slices
            .iter()
            .position(|slice| slice.is_near(spec) && slice.is_aligned(alignment))
        {
            let slice = self.free_slices.remove(found);
            self.mark_dirty(&slice.block);
            return Some(slice);
        }

        self.alloc_block_near(spec)
    }

    fn alloc_block_near(&mut self, spec: Option<&AddressSpec>) -> Option<CodeSlice> {
        let size = page_size();

        let block = if self.rwx {
            let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
            let pages = match spec {
                Some(spec) => pages::try_alloc_pages_near(1, prot, spec)?,
                None => pages::alloc_pages(1, prot).ok()?,
            };
            Rc::new(Block {
                data: pages.as_ptr(),
                size,
                backing: Backing::Pages(pages),
            })
        } else {
            let segment = CodeSegment::new(size, spec).ok()?;
            let block = Rc::new(Block {
                data: segment.address(),
                size,
                backing: Backing::Segment(segment),
            });
            self.uncommitted.push(block.clone());
            block
        };

        for index in (1..self.slices_per_page).rev() {
            self.free_slices.push(CodeSlice {
                data: unsafe { block.data.add(index * self.slice_size) },
                size: self.slice_size,
                block: block.clone(),
            });
        }

        self.mark_dirty(&block);

        Some(CodeSlice {
            data: block.data,
            size: self.slice_size,
            block,
        })
    }

    fn mark_dirty(&mut self, block: &Rc<Block>) {
        self.dirty.insert(block.data as usize, block.clone());
    }

    /// Makes all allocations performed since the last commit executable.
    ///
    /// Uncommitted W^X blocks are realized and remapped read+execute and
    /// the instruction cache is flushed over every dirty page. Under W^X
    /// the free list is also dropped, since its slices cannot be reused
    /// across a commit boundary.
    pub fn commit(&mut self) -> Result<(), Errno> {
        for block in self.uncommitted.drain(..) {
            if let Backing::Segment(segment) = &block.backing {
                segment.realize()?;
                segment.map()?;
            }
        }

        for (_, block) in self.dirty.drain() {
            pages::clear_cache(block.data, block.size);
        }

        if !self.rwx {
            self.free_slices.clear();
        }

        Ok(())
    }

    /// Releases a slice.
    ///
    /// With RWX pages the slice returns to the free list for reuse; under
    /// W^X it only drops its block reference, and the page is released
    /// once every sibling slice is gone.
    pub fn free_slice(&mut self, slice: CodeSlice) {
        if self.rwx {
            self.free_slices.push(slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_distinct_and_aligned() {
        let mut allocator = CodeAllocator::new(64);
        let per_page = allocator.slices_per_page();
        assert_eq!(per_page, page_size() / 64);

        let mut seen = std::collections::HashSet::new();
        let mut slices = Vec::new();
        for _ in 0..100 {
            let slice = allocator.try_alloc_slice_near(None, 16).unwrap();
            assert_eq!(slice.as_ptr() as usize % 16, 0);
            assert!(seen.insert(slice.as_ptr() as usize));
            slices.push(slice);
        }

        // ceil(100 / slices_per_page) unique pages.
        let page_mask = !(page_size() - 1);
        let unique_pages: std::collections::HashSet<usize> = slices
            .iter()
            .map(|slice| slice.as_ptr() as usize & page_mask)
            .collect();
        assert_eq!(unique_pages.len(), (100 + per_page - 1) / per_page);
    }

    #[test]
    fn freed_slices_are_reused_when_rwx() {
        let mut allocator = CodeAllocator::with_policy(128, true);
        if !rwx_supported() {
            return;
        }

        let slice = allocator.alloc_slice().unwrap();
        let address = slice.as_ptr();
        allocator.free_slice(slice);

        let again = allocator
            .try_alloc_slice_near(
                Some(&AddressSpec::new(address as usize, 4096)),
                0,
            )
            .unwrap();
        assert!(again.as_ptr() as usize & !(page_size() - 1)
            == address as usize & !(page_size() - 1));
    }

    #[test]
    fn near_slices_stay_in_window() {
        let mut allocator = CodeAllocator::new(64);

        let anchor = allocator.alloc_slice().unwrap();
        let spec = AddressSpec::new(anchor.as_ptr() as usize, 128 * 1024 * 1024);

        for _ in 0..10 {
            let slice = allocator.try_alloc_slice_near(Some(&spec), 16).unwrap();
            let start = slice.as_ptr() as usize;
            let end = start + slice.len() - 1;
            assert!(start.abs_diff(spec.near_address) <= spec.max_distance);
            assert!(end.abs_diff(spec.near_address) <= spec.max_distance);
            assert_eq!(start % 16, 0);
        }
    }
}
