/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! CPU-type probing from ELF images and auxiliary vectors.

use std::fs;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;

use goblin::elf::header::EI_DATA;
use goblin::elf::header::ELFDATA2LSB;
use goblin::elf::header::ELFDATA2MSB;
use goblin::elf::header::ELFMAG;
use goblin::elf::header::EM_386;
use goblin::elf::header::EM_AARCH64;
use goblin::elf::header::EM_ARM;
use goblin::elf::header::EM_X86_64;

use crate::Error;

/// Instruction-set families this crate can identify.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuType {
    /// 32-bit x86.
    Ia32,
    /// 64-bit x86.
    Amd64,
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM.
    Arm64,
}

// e_machine lives at offset 0x12 of the ELF header.
const E_MACHINE_OFFSET: u64 = 0x12;

/// Determines the CPU type of the ELF image at `path`.
pub fn cpu_type_from_file(path: &str) -> Result<CpuType, Error> {
    let mut file = fs::File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound("file not found".to_owned()),
        io::ErrorKind::PermissionDenied => Error::PermissionDenied,
        _ => Error::from(err),
    })?;

    let mut ident = [0u8; 16];
    file.read_exact(&mut ident)
        .map_err(|_| Error::NotSupported("unsupported executable"))?;
    if &ident[..4] != &ELFMAG[..] {
        return Err(Error::NotSupported("unsupported executable"));
    }

    let mut machine = [0u8; 2];
    file.seek(SeekFrom::Start(E_MACHINE_OFFSET))
        .and_then(|_| file.read_exact(&mut machine))
        .map_err(|_| Error::NotSupported("unsupported executable"))?;

    let e_machine = match ident[EI_DATA] {
        ELFDATA2LSB => u16::from_le_bytes(machine),
        ELFDATA2MSB => u16::from_be_bytes(machine),
        _ => return Err(Error::NotSupported("unsupported ELF EI_DATA")),
    };

    match e_machine {
        EM_386 => Ok(CpuType::Ia32),
        EM_X86_64 => Ok(CpuType::Amd64),
        EM_ARM => Ok(CpuType::Arm),
        EM_AARCH64 => Ok(CpuType::Arm64),
        _ => Err(Error::NotSupported("unsupported executable")),
    }
}

/// Determines the CPU type of the live process `pid` from its auxv.
pub fn cpu_type_from_pid(pid: libc::pid_t) -> Result<CpuType, Error> {
    let auxv = fs::read(format!("/proc/{}/auxv", pid)).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound("process not found".to_owned()),
        io::ErrorKind::PermissionDenied => Error::PermissionDenied,
        _ => Error::from(err),
    })?;

    if auxv.is_empty() {
        return Err(Error::NotFound("process not found".to_owned()));
    }

    Ok(cpu_type_from_auxv(&auxv))
}

/// Infers the word width of an auxv and maps it onto the host's CPU
/// family.
///
/// Auxv entries are natively sized, so a 64-bit vector has zero high
/// halves in every type word. A vector shorter than two 64-bit zeros can
/// only be the 32-bit terminator-only case.
pub fn cpu_type_from_auxv(auxv: &[u8]) -> CpuType {
    #[cfg(target_arch = "x86_64")]
    let (cpu32, cpu64) = (CpuType::Ia32, CpuType::Amd64);
    #[cfg(target_arch = "aarch64")]
    let (cpu32, cpu64) = (CpuType::Arm, CpuType::Arm64);

    if auxv.len() < 16 {
        return cpu32;
    }

    let mut i = 0;
    while i + 8 <= auxv.len() {
        let auxv_type = u64::from_ne_bytes(auxv[i..i + 8].try_into().unwrap());
        if auxv_type & 0xffff_ffff_0000_0000 != 0 {
            return cpu32;
        }
        i += 16;
    }

    cpu64
}
