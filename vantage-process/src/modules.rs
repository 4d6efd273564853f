/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Enumeration of loaded modules and mapped memory ranges.
//!
//! Module enumeration prefers the runtime linker's `dl_iterate_phdr` when
//! the C library exports it; otherwise it falls back to scanning the maps
//! file and probing each candidate mapping for the ELF magic. Callbacks
//! return `true` to keep iterating.

use std::collections::HashMap;

use goblin::elf::header::ELFMAG;
use libc::c_void;
use tracing::debug;

use crate::maps::MapRecord;
use crate::maps::MapsIter;
use crate::maps::Protection;
use crate::ranges::basename;
use crate::ranges::compute_elf_range_from_phdrs;
use crate::ranges::query_program_modules;
use crate::ranges::RuntimeLinker;
use crate::resolve;
use crate::MemoryRange;

/// A loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDetails {
    /// Basename of [`ModuleDetails::path`].
    pub name: String,
    /// Filesystem path the module was mapped from.
    pub path: String,
    /// The module's in-memory span.
    pub range: MemoryRange,
}

/// A contiguous named span of mappings, keyed by base address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRange {
    /// The mapping's path column (vDSO translated).
    pub name: String,
    /// First address of the merged span.
    pub base: u64,
    /// Size of the merged span.
    pub size: u64,
}

/// A file backing a mapped range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    /// Path of the backing file.
    pub path: String,
    /// Offset of the mapping within the file.
    pub offset: u64,
}

/// One mapped range with its protection and optional backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDetails {
    /// The mapped span.
    pub range: MemoryRange,
    /// Protection bits of the mapping.
    pub protection: Protection,
    /// The backing file, for file mappings with an absolute path.
    pub file: Option<FileMapping>,
}

/// Enumerates loaded modules, stopping early when `func` returns `false`.
pub fn enumerate_modules<F>(func: F)
where
    F: FnMut(&ModuleDetails) -> bool,
{
    do_enumerate_modules(resolve::query_libc_name(), func)
}

pub(crate) fn do_enumerate_modules<F>(libc_name: &str, mut func: F)
where
    F: FnMut(&ModuleDetails) -> bool,
{
    let pm = query_program_modules();

    if pm.rtld == RuntimeLinker::None {
        if !func(&pm.program) {
            return;
        }
        if let Some(vdso) = &pm.vdso {
            func(vdso);
        }
        return;
    }

    match resolve::dl_iterate_phdr_impl(libc_name) {
        Some(iterate_phdr) => {
            debug!("enumerating modules via dl_iterate_phdr");
            enumerate_modules_by_using_libc(iterate_phdr, &mut func);
        }
        None => {
            debug!("enumerating modules via /proc/self/maps");
            enumerate_modules_from_maps(func);
        }
    }
}

struct EmitModulesContext<'a> {
    func: &'a mut dyn FnMut(&ModuleDetails) -> bool,
    named_ranges: HashMap<u64, NamedRange>,
}

fn enumerate_modules_by_using_libc(
    iterate_phdr: resolve::DlIteratePhdrFn,
    func: &mut dyn FnMut(&ModuleDetails) -> bool,
) {
    let mut ctx = EmitModulesContext {
        func,
        named_ranges: collect_named_ranges(),
    };

    unsafe {
        iterate_phdr(
            emit_module_from_phdr,
            &mut ctx as *mut EmitModulesContext as *mut c_void,
        );
    }
}

unsafe extern "C" fn emit_module_from_phdr(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    let ctx = &mut *(data as *mut EmitModulesContext);
    let info = &*info;

    let range = compute_elf_range_from_phdrs(
        info.dlpi_phdr as u64,
        core::mem::size_of::<libc::Elf64_Phdr>() as u64,
        info.dlpi_phnum as u64,
        0,
    );

    // The linker reports an empty name for the main program; substitute
    // the maps-derived name for the same base.
    let path = match ctx.named_ranges.get(&range.base_address) {
        Some(named) => named.name.clone(),
        None if !info.dlpi_name.is_null() => core::ffi::CStr::from_ptr(info.dlpi_name)
            .to_string_lossy()
            .into_owned(),
        None => String::new(),
    };

    let details = ModuleDetails {
        name: basename(&path).to_owned(),
        range,
        path,
    };

    if (ctx.func)(&details) {
        0
    } else {
        1
    }
}

/// Enumerates modules by walking the maps file: readable private mappings
/// whose first bytes carry the ELF magic, rooted at `/` (or the translated
/// vDSO) and not under `/dev/`. Consecutive mappings of the same path merge
/// into one module.
pub fn enumerate_modules_from_maps<F>(mut func: F)
where
    F: FnMut(&ModuleDetails) -> bool,
{
    let mut iter = match MapsIter::open_self() {
        Some(iter) => iter,
        None => return,
    };

    let mut pending: Option<(u64, u64, Protection, bool, String)> = None;

    loop {
        let (start, mut end, protection, shared, mut path) = match pending.take() {
            Some(rec) => rec,
            None => match next_named_record(&mut iter) {
                Some(rec) => rec,
                None => break,
            },
        };

        let is_vdso = try_translate_vdso_name(&mut path);

        let readable = protection.contains(Protection::READ);
        if !readable || shared {
            continue;
        }
        if (!path.starts_with('/') && !is_vdso) || path.starts_with("/dev/") {
            continue;
        }
        if unsafe {
            core::slice::from_raw_parts(start as *const u8, 4) != &ELFMAG[..]
        } {
            continue;
        }

        // Pull in the module's remaining sub-ranges.
        while let Some(next) = next_named_record(&mut iter) {
            let (next_start, next_end, next_prot, next_shared, mut next_path) = next;
            if next_path.is_empty() {
                continue;
            }
            if next_path.starts_with('[') && !try_translate_vdso_name(&mut next_path) {
                continue;
            }
            if next_path == path {
                end = next_end;
            } else {
                pending = Some((next_start, next_end, next_prot, next_shared, next_path));
                break;
            }
        }

        let details = ModuleDetails {
            name: basename(&path).to_owned(),
            range: MemoryRange {
                base_address: start,
                size: end - start,
            },
            path,
        };

        if !func(&details) {
            break;
        }
    }
}

fn next_named_record(iter: &mut MapsIter) -> Option<(u64, u64, Protection, bool, String)> {
    let line = iter.next_line()?;
    let rec = MapRecord::parse(line)?;
    Some((
        rec.start,
        rec.end,
        rec.protection,
        rec.shared,
        rec.path.to_owned(),
    ))
}

/// Collects every named mapping, merging consecutive same-path sub-ranges,
/// keyed by base address. Used to decorate `dl_iterate_phdr` results whose
/// name string is empty.
pub fn collect_named_ranges() -> HashMap<u64, NamedRange> {
    let mut result = HashMap::new();

    let mut iter = match MapsIter::open_self() {
        Some(iter) => iter,
        None => return result,
    };

    let mut pending: Option<(u64, u64, Protection, bool, String)> = None;

    loop {
        let (start, mut end, .., mut name) = match pending.take() {
            Some(rec) => rec,
            None => match next_named_record(&mut iter) {
                Some(rec) => rec,
                None => break,
            },
        };

        if name.is_empty() {
            continue;
        }
        try_translate_vdso_name(&mut name);

        while let Some(next) = next_named_record(&mut iter) {
            let (next_start, next_end, next_prot, next_shared, mut next_name) = next;
            if next_name.is_empty() {
                continue;
            }
            if next_name.starts_with('[') && !try_translate_vdso_name(&mut next_name) {
                continue;
            }
            if next_name == name {
                end = next_end;
            } else {
                pending = Some((next_start, next_end, next_prot, next_shared, next_name));
                break;
            }
        }

        result.insert(
            start,
            NamedRange {
                name,
                base: start,
                size: end - start,
            },
        );
    }

    result
}

fn try_translate_vdso_name(name: &mut String) -> bool {
    if name == "[vdso]" {
        *name = "linux-vdso.so.1".to_owned();
        true
    } else {
        false
    }
}

/// Enumerates the current process's mapped ranges whose protection covers
/// `prot`, stopping early when `func` returns `false`.
pub fn enumerate_ranges<F>(prot: Protection, func: F)
where
    F: FnMut(&RangeDetails) -> bool,
{
    enumerate_ranges_of(unsafe { libc::getpid() }, prot, func)
}

/// Enumerates the mapped ranges of `pid`.
pub fn enumerate_ranges_of<F>(pid: libc::pid_t, prot: Protection, mut func: F)
where
    F: FnMut(&RangeDetails) -> bool,
{
    let mut iter = match MapsIter::open_pid(pid) {
        Some(iter) => iter,
        None => return,
    };

    while let Some(line) = iter.next_line() {
        let rec = match MapRecord::parse(line) {
            Some(rec) => rec,
            None => continue,
        };

        if !rec.protection.contains(prot) {
            continue;
        }

        let file = (rec.inode != 0 && rec.path.starts_with('/')).then(|| FileMapping {
            path: rec.path.to_owned(),
            offset: rec.offset,
        });

        let details = RangeDetails {
            range: MemoryRange {
                base_address: rec.start,
                size: rec.end - rec.start,
            },
            protection: rec.protection,
            file,
        };

        if !func(&details) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modules_include_the_program() {
        let program = query_program_modules().program.clone();
        let mut found = false;
        enumerate_modules(|m| {
            if m.range.base_address == program.range.base_address {
                found = true;
                assert_eq!(m.path, program.path);
                return false;
            }
            true
        });
        assert!(found);
    }

    #[test]
    fn enumeration_stops_when_asked() {
        let mut count = 0;
        enumerate_modules(|_| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn maps_enumeration_reports_absolute_paths() {
        enumerate_modules_from_maps(|m| {
            assert!(m.path.starts_with('/') || m.path == "linux-vdso.so.1");
            assert_eq!(m.name, basename(&m.path));
            assert_ne!(m.range.size, 0);
            true
        });
    }

    #[test]
    fn named_ranges_cover_the_program() {
        let ranges = collect_named_ranges();
        let program = &query_program_modules().program;
        let named = ranges
            .get(&program.range.base_address)
            .expect("program has a named range");
        assert_eq!(named.name, program.path);
    }

    #[test]
    fn range_enumeration_respects_protection_filter() {
        let mut total = 0;
        enumerate_ranges(Protection::READ | Protection::EXECUTE, |details| {
            assert!(details
                .protection
                .contains(Protection::READ | Protection::EXECUTE));
            total += 1;
            true
        });
        assert!(total > 0);
    }
}
