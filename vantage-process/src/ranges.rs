/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Discovery of the program, interpreter, and vDSO images from the
//! auxiliary vector.
//!
//! The auxv is read twice: from `/proc/self/auxv` (the kernel view) and by
//! scanning the main-thread stack (the view handed to the program at
//! start). When the program was launched through its interpreter (e.g.
//! `ld.so ./prog`), the kernel view describes the interpreter, and only the
//! cross-check against the stack view untangles the two.

use std::fs;
use std::io;

use byteorder::NativeEndian;
use byteorder::ReadBytesExt;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::program_header::PT_PHDR;
use goblin::elf64::header::Header as Ehdr;
use goblin::elf64::program_header::ProgramHeader as Phdr;
use lazy_static::lazy_static;

use crate::dumpable;
use crate::maps::MapRecord;
use crate::maps::MapsIter;
use crate::modules::ModuleDetails;
use crate::page_size;
use crate::MemoryRange;

/// Whether the program runs under a shared runtime linker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RuntimeLinker {
    /// Static binary; no interpreter is mapped.
    None,
    /// A shared `ld.so` interpreter is mapped alongside the program.
    Shared,
}

/// The three images every Linux process starts out with.
#[derive(Debug, Clone)]
pub struct ProgramModules {
    /// The main program.
    pub program: ModuleDetails,
    /// The runtime linker, when one is mapped.
    pub interpreter: Option<ModuleDetails>,
    /// The kernel-injected vDSO, reported as `linux-vdso.so.1`.
    pub vdso: Option<ModuleDetails>,
    /// Kind of runtime linker in use.
    pub rtld: RuntimeLinker,
}

#[derive(Debug, Default, Copy, Clone)]
struct ProgramRanges {
    program: MemoryRange,
    interpreter: MemoryRange,
    vdso: MemoryRange,
}

type AuxvEntry = (u64, u64);

lazy_static! {
    static ref PROGRAM_MODULES: ProgramModules = query_program_modules_uncached();
}

/// Returns the program/interpreter/vDSO descriptors, computed once for the
/// lifetime of the process.
pub fn query_program_modules() -> &'static ProgramModules {
    &PROGRAM_MODULES
}

fn query_program_modules_uncached() -> ProgramModules {
    let kern = read_auxv_from_proc().and_then(|auxv| query_program_ranges(&auxv));
    let user = read_auxv_from_stack().and_then(|auxv| query_program_ranges(&auxv));

    let ranges = match (kern, user) {
        (Some(kern), Some(user)) if user.program.base_address != kern.program.base_address => {
            // The "program" the kernel reported is actually the
            // interpreter the program was launched through.
            ProgramRanges {
                interpreter: kern.program,
                ..user
            }
        }
        (Some(kern), _) => kern,
        (None, Some(user)) => user,
        (None, None) => ProgramRanges::default(),
    };

    let mut program = ModuleDetails {
        name: String::new(),
        path: String::new(),
        range: ranges.program,
    };
    let mut interpreter = ModuleDetails {
        name: String::new(),
        path: String::new(),
        range: ranges.interpreter,
    };

    // Match mapping start addresses against the resolved bases to learn
    // the on-disk paths.
    if let Some(mut iter) = MapsIter::open_self() {
        while let Some(line) = iter.next_line() {
            let rec = match MapRecord::parse(line) {
                Some(rec) => rec,
                None => continue,
            };

            let m = if rec.start == ranges.program.base_address {
                &mut program
            } else if rec.start == ranges.interpreter.base_address {
                &mut interpreter
            } else {
                continue;
            };

            m.path = rec.path.to_owned();
            m.name = basename(&m.path).to_owned();
        }
    }

    let vdso = (ranges.vdso.base_address != 0).then(|| ModuleDetails {
        name: "linux-vdso.so.1".to_owned(),
        path: "linux-vdso.so.1".to_owned(),
        range: ranges.vdso,
    });

    let rtld = if ranges.interpreter.base_address == 0 {
        RuntimeLinker::None
    } else {
        RuntimeLinker::Shared
    };

    ProgramModules {
        program,
        interpreter: (rtld == RuntimeLinker::Shared).then_some(interpreter),
        vdso,
        rtld,
    }
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn query_program_ranges(auxv: &[AuxvEntry]) -> Option<ProgramRanges> {
    let mut phdrs = 0u64;
    let mut phdr_size = 0u64;
    let mut phdr_count = 0u64;
    let mut interpreter = 0u64;
    let mut vdso = 0u64;

    for &(kind, value) in auxv {
        match kind as libc::c_ulong {
            libc::AT_PHDR => phdrs = value,
            libc::AT_PHENT => phdr_size = value,
            libc::AT_PHNUM => phdr_count = value,
            libc::AT_BASE => interpreter = value,
            libc::AT_SYSINFO_EHDR => vdso = value,
            _ => {}
        }
    }

    if phdrs == 0 || phdr_size == 0 || phdr_count == 0 {
        return None;
    }

    Some(ProgramRanges {
        program: unsafe { compute_elf_range_from_phdrs(phdrs, phdr_size, phdr_count, 0) },
        interpreter: unsafe { compute_elf_range_from_ehdr(interpreter) },
        vdso: unsafe { compute_elf_range_from_ehdr(vdso) },
    })
}

/// Reads the auxiliary vector out of `/proc/self/auxv`.
///
/// Held under the dumpability guard: hardened hosts refuse the read for
/// non-dumpable processes.
pub(crate) fn read_auxv_from_proc() -> Option<Vec<AuxvEntry>> {
    let _guard = dumpable::acquire_dumpability();

    let buf = fs::read("/proc/self/auxv").ok()?;
    let mut cursor = io::Cursor::new(buf);
    let mut auxv = Vec::new();

    while let (Ok(kind), Ok(value)) = (
        cursor.read_u64::<NativeEndian>(),
        cursor.read_u64::<NativeEndian>(),
    ) {
        if kind == libc::AT_NULL as u64 {
            break;
        }
        auxv.push((kind, value));
    }

    (!auxv.is_empty()).then_some(auxv)
}

/// Recovers the auxiliary vector by scanning the main-thread stack.
///
/// The anchor is an `AT_PHENT` entry whose value is the native program
/// header size; the scan then widens backward until an entry whose type
/// exceeds the page size marks the spot just before the vector starts, and
/// forward to the `AT_NULL` terminator.
pub(crate) fn read_auxv_from_stack() -> Option<Vec<AuxvEntry>> {
    let stack = query_main_thread_stack_range()?;
    let words = unsafe {
        core::slice::from_raw_parts(
            stack.base_address as *const u64,
            (stack.size / 8) as usize,
        )
    };

    let needle_value = core::mem::size_of::<Phdr>() as u64;
    let mut last_match = None;
    for i in 0..words.len().saturating_sub(1) {
        if words[i] == libc::AT_PHENT as u64 && words[i + 1] == needle_value {
            last_match = Some(i);
        }
    }
    let anchor = last_match?;

    let page_size = page_size() as u64;
    let mut start = anchor % 2;
    let mut cursor = anchor;
    while cursor >= 2 {
        cursor -= 2;
        if words[cursor] >= page_size {
            start = cursor + 2;
            break;
        }
    }

    let mut end = None;
    let mut cursor = anchor + 2;
    while cursor + 1 < words.len() {
        if words[cursor] == libc::AT_NULL as u64 {
            end = Some(cursor);
            break;
        }
        cursor += 2;
    }
    let end = end?;

    let auxv: Vec<AuxvEntry> = (start..end)
        .step_by(2)
        .map(|i| (words[i], words[i + 1]))
        .collect();
    (!auxv.is_empty()).then_some(auxv)
}

fn query_main_thread_stack_range() -> Option<MemoryRange> {
    let mut iter = MapsIter::open_self()?;
    while let Some(line) = iter.next_line() {
        if line.ends_with(b" [stack]") {
            let rec = MapRecord::parse(line)?;
            return Some(MemoryRange {
                base_address: rec.start,
                size: rec.end - rec.start,
            });
        }
    }
    None
}

/// Computes the in-memory span of an ELF image from its header.
///
/// # Safety
///
/// `ehdr` must be zero or the address of a mapped ELF header whose program
/// headers are mapped too.
pub(crate) unsafe fn compute_elf_range_from_ehdr(ehdr: u64) -> MemoryRange {
    if ehdr == 0 {
        return MemoryRange::default();
    }

    let header = &*(ehdr as *const Ehdr);
    compute_elf_range_from_phdrs(
        ehdr + header.e_phoff,
        header.e_phentsize as u64,
        header.e_phnum as u64,
        ehdr,
    )
}

/// Computes the in-memory span of an ELF image from its program headers.
///
/// The base derives from `PT_PHDR` when present, else from the first
/// `PT_LOAD` with a zero offset, else from the header location itself.
///
/// # Safety
///
/// `phdrs` must point at `phdr_count` mapped program headers of
/// `phdr_size` bytes each.
pub(crate) unsafe fn compute_elf_range_from_phdrs(
    phdrs: u64,
    phdr_size: u64,
    phdr_count: u64,
    base_address: u64,
) -> MemoryRange {
    let page_size = page_size() as u64;
    let page_start = |value: u64| value & !(page_size - 1);

    let mut range = MemoryRange::default();
    let mut lowest = u64::MAX;
    let mut highest = 0;

    for i in 0..phdr_count {
        let phdr = &*((phdrs + i * phdr_size) as *const Phdr);

        if phdr.p_type == PT_PHDR {
            range.base_address = phdrs - phdr.p_offset;
        }

        if phdr.p_type == PT_LOAD {
            if phdr.p_offset == 0 && range.base_address == 0 {
                range.base_address = phdr.p_vaddr;
            }
            lowest = lowest.min(page_start(phdr.p_vaddr));
            highest = highest.max(phdr.p_vaddr + phdr.p_memsz);
        }
    }

    if range.base_address == 0 {
        range.base_address = if base_address != 0 {
            base_address
        } else {
            page_start(phdrs)
        };
    }

    range.size = highest.saturating_sub(lowest);
    range
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auxv_from_proc_has_phdr() {
        let auxv = read_auxv_from_proc().unwrap();
        assert!(auxv.iter().any(|&(kind, _)| kind == libc::AT_PHDR as u64));
        assert!(auxv.iter().any(|&(kind, _)| kind == libc::AT_PHNUM as u64));
    }

    #[test]
    fn auxv_sources_agree_on_program() {
        let kern = read_auxv_from_proc()
            .and_then(|a| query_program_ranges(&a))
            .unwrap();
        let user = read_auxv_from_stack()
            .and_then(|a| query_program_ranges(&a))
            .unwrap();

        // Launched normally, both views describe the same program.
        assert_eq!(kern.program.base_address, user.program.base_address);
        assert_eq!(kern.program.size, user.program.size);
    }

    #[test]
    fn range_recomputes_from_own_base() {
        let modules = query_program_modules();
        let range = modules.program.range;
        assert_ne!(range.base_address, 0);
        assert_ne!(range.size, 0);

        // Round trip: the phdrs reachable from the yielded base produce
        // the identical range.
        let recomputed = unsafe { compute_elf_range_from_ehdr(range.base_address) };
        assert_eq!(recomputed.base_address, range.base_address);
        assert_eq!(recomputed.size, range.size);
    }

    #[test]
    fn program_range_covers_own_code() {
        let modules = query_program_modules();
        let here = program_range_covers_own_code as usize as u64;
        assert!(modules.program.range.includes(here));
    }
}
