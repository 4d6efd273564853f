/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Module and symbol resolution on top of the runtime linker.
//!
//! Handles are taken without loading (`RTLD_LAZY | RTLD_NOLOAD`); on musl,
//! which lacks that primitive, the link-map chain is walked and matched by
//! path suffix instead.

use std::ffi::CStr;
use std::ffi::CString;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use lazy_static::lazy_static;
use libc::c_char;
use libc::c_int;
use libc::c_void;

use crate::modules;
use crate::ranges::query_program_modules;
use crate::ranges::RuntimeLinker;
use crate::Error;

/// The signature of the C library's `dl_iterate_phdr`.
pub(crate) type DlIteratePhdrFn = unsafe extern "C" fn(
    unsafe extern "C" fn(*mut libc::dl_phdr_info, libc::size_t, *mut c_void) -> c_int,
    *mut c_void,
) -> c_int;

/// The head of the linker's module chain. The libc crate does not export
/// this; only the leading, ABI-stable fields are declared.
#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const c_char,
    l_ld: usize,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

lazy_static! {
    static ref LIBC_NAME: String = try_init_libc_name()
        .expect("unable to locate the C library; this host is unsupported");
}

/// Returns the resolved path of the C library the process runs on.
///
/// Aborts the process when neither `__libc_start_main` nor `exit` can be
/// resolved, which indicates a fundamentally unsupported host.
pub fn query_libc_name() -> &'static str {
    &LIBC_NAME
}

fn try_init_libc_name() -> Option<String> {
    let info = try_resolve_dynamic_symbol("__libc_start_main")
        .or_else(|| try_resolve_dynamic_symbol("exit"))?;

    let fname = unsafe { CStr::from_ptr(info.dli_fname) }
        .to_str()
        .ok()?
        .to_owned();

    do_resolve_module_name(&fname, &fname).map(|(path, _)| path)
}

fn try_resolve_dynamic_symbol(name: &str) -> Option<libc::Dl_info> {
    let name = CString::new(name).ok()?;

    let mut address = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if address.is_null() {
        address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    }
    if address.is_null() {
        return None;
    }

    let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
    (unsafe { libc::dladdr(address, &mut info) } != 0).then_some(info)
}

// 0 = not yet resolved; otherwise the implementation address + 1, so that
// "absent" is representable. The race on first resolution is benign.
static ITERATE_PHDR: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn dl_iterate_phdr_impl(libc_name: &str) -> Option<DlIteratePhdrFn> {
    let mut value = ITERATE_PHDR.load(Ordering::Acquire);
    if value == 0 {
        let impl_address = module_find_export_by_name(Some(libc_name), "dl_iterate_phdr");
        value = impl_address as usize + 1;
        ITERATE_PHDR.store(value, Ordering::Release);
    }

    let impl_address = value - 1;
    if impl_address == 0 {
        None
    } else {
        Some(unsafe { core::mem::transmute::<usize, DlIteratePhdrFn>(impl_address) })
    }
}

/// Resolves an exported symbol to an absolute address, 0 on failure.
///
/// With a module name, a non-loading handle scopes the lookup to that
/// module; with `None` the default global scope is searched.
pub fn module_find_export_by_name(module_name: Option<&str>, symbol_name: &str) -> u64 {
    let symbol = match CString::new(symbol_name) {
        Ok(symbol) => symbol,
        Err(_) => return 0,
    };

    let module = match module_name {
        Some(name) => {
            let module = module_get_handle(name);
            if module.is_null() {
                return 0;
            }
            module
        }
        None => libc::RTLD_DEFAULT,
    };

    let address = unsafe { libc::dlsym(module, symbol.as_ptr()) } as u64;

    if module != libc::RTLD_DEFAULT {
        unsafe {
            libc::dlclose(module);
        }
    }

    address
}

/// Loads `module_name` through the runtime linker.
pub fn module_load(module_name: &str) -> Result<(), Error> {
    let name = CString::new(module_name).map_err(|_| Error::NotFound(module_name.to_owned()))?;

    if unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) }.is_null() {
        let message = unsafe {
            let err = libc::dlerror();
            if err.is_null() {
                module_name.to_owned()
            } else {
                CStr::from_ptr(err).to_string_lossy().into_owned()
            }
        };
        return Err(Error::NotFound(message));
    }

    Ok(())
}

/// Forces constructor execution of an already-mapped module by taking and
/// dropping a lazy-load reference.
pub fn module_ensure_initialized(module_name: &str) -> bool {
    let module = module_get_handle(module_name);
    if module.is_null() {
        return false;
    }
    unsafe {
        libc::dlclose(module);
    }

    #[cfg(not(target_env = "musl"))]
    {
        let name = match CString::new(module_name) {
            Ok(name) => name,
            Err(_) => return false,
        };
        let module = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) };
        if module.is_null() {
            return false;
        }
        unsafe {
            libc::dlclose(module);
        }
    }

    true
}

#[cfg(not(target_env = "musl"))]
fn module_get_handle(module_name: &str) -> *mut c_void {
    let name = match CString::new(module_name) {
        Ok(name) => name,
        Err(_) => return core::ptr::null_mut(),
    };
    unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) }
}

#[cfg(target_env = "musl")]
fn module_get_handle(module_name: &str) -> *mut c_void {
    unsafe {
        let mut cur = libc::dlopen(core::ptr::null(), 0) as *mut LinkMap;
        while !cur.is_null() {
            let path = CStr::from_ptr((*cur).l_name).to_string_lossy();
            if module_path_matches(&path, module_name) {
                return cur as *mut c_void;
            }
            cur = (*cur).l_next;
        }

        // Second pass: match through symlinks.
        let mut cur = libc::dlopen(core::ptr::null(), 0) as *mut LinkMap;
        while !cur.is_null() {
            let path = CStr::from_ptr((*cur).l_name).to_string_lossy();
            if let Ok(target) = std::fs::read_link(path.as_ref()) {
                let parent = std::path::Path::new(path.as_ref())
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("/"));
                let canonical = parent.join(target);
                if module_path_matches(&canonical.to_string_lossy(), module_name) {
                    return cur as *mut c_void;
                }
            }
            cur = (*cur).l_next;
        }

        core::ptr::null_mut()
    }
}

/// Resolves a module name or path to its on-disk path and base address.
pub fn resolve_module_name(name: &str) -> Option<(String, u64)> {
    do_resolve_module_name(name, query_libc_name())
}

pub(crate) fn do_resolve_module_name(name: &str, libc_name: &str) -> Option<(String, u64)> {
    // A handle we can take without loading pins down the module even when
    // several mappings share a basename.
    let mut known_address = 0u64;
    if let Ok(cname) = CString::new(name) {
        let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
        if !handle.is_null() {
            known_address = unsafe { (*(handle as *mut LinkMap)).l_ld } as u64;
            unsafe {
                libc::dlclose(handle);
            }
        }
    }

    let mut resolved: Option<(String, u64)> = None;
    let matcher = |details: &modules::ModuleDetails| -> bool {
        let is_match = if known_address != 0 {
            details.range.includes(known_address)
        } else {
            module_path_matches(&details.path, name)
        };
        if !is_match {
            return true;
        }
        resolved = Some((details.path.clone(), details.range.base_address));
        false
    };

    if name == libc_name && query_program_modules().rtld == RuntimeLinker::None {
        modules::enumerate_modules_from_maps(matcher);
    } else {
        modules::do_enumerate_modules(libc_name, matcher);
    }

    resolved
}

/// Matches a module path against a bare name or an absolute path.
pub fn module_path_matches(path: &str, name_or_path: &str) -> bool {
    if name_or_path.starts_with('/') {
        return name_or_path == path;
    }

    match path.rsplit_once('/') {
        Some((_, base)) => name_or_path == base,
        None => name_or_path == path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libc_is_resolvable() {
        let name = query_libc_name();
        assert!(name.starts_with('/'));
        assert!(name.contains("libc"));
    }

    #[test]
    fn find_export_in_default_scope() {
        assert_ne!(module_find_export_by_name(None, "malloc"), 0);
    }

    #[test]
    fn find_export_in_libc() {
        let address = module_find_export_by_name(Some(query_libc_name()), "malloc");
        assert_ne!(address, 0);
    }

    #[test]
    fn find_export_missing_symbol() {
        assert_eq!(
            module_find_export_by_name(Some(query_libc_name()), "vantage_no_such_symbol"),
            0
        );
    }

    #[test]
    fn find_export_missing_module() {
        assert_eq!(
            module_find_export_by_name(Some("libdoesnotexist.so.9"), "malloc"),
            0
        );
    }

    #[test]
    fn libc_can_be_reinitialized() {
        assert!(module_ensure_initialized(query_libc_name()));
    }

    #[test]
    fn resolve_by_basename() {
        let libc_path = query_libc_name();
        let base_name = libc_path.rsplit('/').next().unwrap();
        let (path, base) = resolve_module_name(base_name).unwrap();
        assert_eq!(path, libc_path);
        assert_ne!(base, 0);
    }

    #[test]
    fn path_matching() {
        assert!(module_path_matches("/usr/lib/libc.so.6", "libc.so.6"));
        assert!(module_path_matches("/usr/lib/libc.so.6", "/usr/lib/libc.so.6"));
        assert!(!module_path_matches("/usr/lib/libc.so.6", "/lib/libc.so.6"));
        assert!(!module_path_matches("/usr/lib/libc.so.6", "libm.so.6"));
        assert!(module_path_matches("libc.so.6", "libc.so.6"));
    }
}
