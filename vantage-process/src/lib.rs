/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(rustdoc::broken_intra_doc_links)]
#![cfg(target_os = "linux")]

//! In-process introspection for Linux: enumerate loaded modules, memory
//! ranges, and threads of the current process, resolve symbols through the
//! runtime linker, and read or mutate the register state of any thread,
//! including threads blocked in the kernel, without leaving the process.
//!
//! The cross-thread register machinery is built on a helper task cloned
//! outside the calling thread group (Linux forbids ptrace within a thread
//! group); see [`modify_thread`] for the protocol.

mod cpu_type;
mod dumpable;
mod error;
mod maps;
mod modify;
mod modules;
mod ranges;
mod regs;
mod resolve;
pub mod sys;
mod thread;

pub use cpu_type::cpu_type_from_auxv;
pub use cpu_type::cpu_type_from_file;
pub use cpu_type::cpu_type_from_pid;
pub use cpu_type::CpuType;
pub use dumpable::acquire_dumpability;
pub use dumpable::DumpabilityGuard;
pub use error::Error;
pub use maps::MapRecord;
pub use maps::MapsIter;
pub use maps::Protection;
pub use modify::modify_thread;
pub use modules::collect_named_ranges;
pub use modules::enumerate_modules;
pub use modules::enumerate_modules_from_maps;
pub use modules::enumerate_ranges;
pub use modules::enumerate_ranges_of;
pub use modules::FileMapping;
pub use modules::ModuleDetails;
pub use modules::NamedRange;
pub use modules::RangeDetails;
pub use ranges::query_program_modules;
pub use ranges::ProgramModules;
pub use ranges::RuntimeLinker;
pub use regs::CpuContext;
pub use regs::Regs;
pub use resolve::module_ensure_initialized;
pub use resolve::module_find_export_by_name;
pub use resolve::module_load;
pub use resolve::module_path_matches;
pub use resolve::query_libc_name;
pub use resolve::resolve_module_name;
pub use thread::current_thread_id;
pub use thread::current_thread_ranges;
pub use thread::enumerate_threads;
pub use thread::has_thread;
pub use thread::is_debugger_attached;
pub use thread::thread_resume;
pub use thread::thread_suspend;
pub use thread::ThreadDetails;
pub use thread::ThreadId;
pub use thread::ThreadState;

use lazy_static::lazy_static;

/// A half-open span of addresses: `base_address <= a < base_address + size`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    /// First address of the range.
    pub base_address: u64,
    /// Length of the range in bytes.
    pub size: u64,
}

impl MemoryRange {
    /// Whether `address` falls inside the range.
    pub fn includes(&self, address: u64) -> bool {
        address >= self.base_address && address < self.base_address + self.size
    }
}

lazy_static! {
    static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

/// The system page size.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// The current process id.
pub fn process_id() -> libc::pid_t {
    unsafe { libc::getpid() }
}
