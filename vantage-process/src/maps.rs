/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A line-oriented reader over `/proc/<pid>/maps`.
//!
//! The reader refills a fixed-size buffer through the raw syscall layer and
//! lends out one line at a time, so it can run in contexts where heap
//! allocation is undesirable and the libc stdio machinery is off-limits.

use std::ffi::CString;

use crate::sys;

bitflags::bitflags! {
    /// Page protection bits as reported by the maps `perms` column.
    pub struct Protection: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// Parses the leading `rwx` characters of a maps permission column.
    pub fn from_perms(perms: &str) -> Protection {
        let mut prot = Protection::empty();
        let bytes = perms.as_bytes();
        if bytes.first() == Some(&b'r') {
            prot |= Protection::READ;
        }
        if bytes.get(1) == Some(&b'w') {
            prot |= Protection::WRITE;
        }
        if bytes.get(2) == Some(&b'x') {
            prot |= Protection::EXECUTE;
        }
        prot
    }
}

const BUFFER_SIZE: usize = 4096;

/// Buffered iterator over the lines of a maps file.
///
/// Each [`MapsIter::next_line`] call yields a view that is only valid until
/// the next call; callers that keep a line copy it out.
pub struct MapsIter {
    fd: i32,
    buf: [u8; BUFFER_SIZE],
    read_pos: usize,
    write_pos: usize,
}

impl MapsIter {
    /// Opens `/proc/self/maps`.
    pub fn open_self() -> Option<MapsIter> {
        Self::open_path("/proc/self/maps")
    }

    /// Opens `/proc/<pid>/maps`.
    pub fn open_pid(pid: libc::pid_t) -> Option<MapsIter> {
        Self::open_path(&format!("/proc/{}/maps", pid))
    }

    fn open_path(path: &str) -> Option<MapsIter> {
        let path = CString::new(path).ok()?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return None;
        }
        Some(MapsIter {
            fd,
            buf: [0u8; BUFFER_SIZE],
            read_pos: 0,
            write_pos: 0,
        })
    }

    /// Returns the next line, without its trailing newline.
    pub fn next_line(&mut self) -> Option<&[u8]> {
        let mut newline = find_byte(&self.buf[self.read_pos..self.write_pos], b'\n');

        if newline.is_none() {
            // Compact what's left to the front and refill.
            let available = self.write_pos - self.read_pos;
            if self.read_pos > 0 {
                self.buf.copy_within(self.read_pos..self.write_pos, 0);
                self.read_pos = 0;
                self.write_pos = available;
            }

            let res = unsafe {
                sys::read(
                    self.fd,
                    self.buf.as_mut_ptr().add(self.write_pos),
                    BUFFER_SIZE - self.write_pos,
                )
            };
            if res <= 0 {
                return None;
            }
            self.write_pos += res as usize;

            newline = find_byte(&self.buf[self.read_pos..self.write_pos], b'\n');
        }

        let newline = self.read_pos + newline?;
        let start = self.read_pos;
        self.read_pos = newline + 1;
        Some(&self.buf[start..newline])
    }
}

impl Drop for MapsIter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

/// One parsed maps line.
///
/// Every column except the trailing path has a fixed shape; the path is
/// whatever remains after the inode column, which is the only way to handle
/// paths containing spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRecord<'a> {
    /// First address of the mapping.
    pub start: u64,
    /// One past the last address of the mapping.
    pub end: u64,
    /// The parsed protection bits.
    pub protection: Protection,
    /// Whether the mapping is `MAP_SHARED`.
    pub shared: bool,
    /// File offset of the mapping.
    pub offset: u64,
    /// Inode, zero for anonymous mappings.
    pub inode: u64,
    /// Trailing path column; empty for anonymous mappings.
    pub path: &'a str,
}

impl<'a> MapRecord<'a> {
    /// Parses a single maps line of the form
    /// `start-end perms offset dev inode path`.
    pub fn parse(line: &'a [u8]) -> Option<MapRecord<'a>> {
        let line = core::str::from_utf8(line).ok()?;

        let (start, rest) = take_hex(line)?;
        let rest = rest.strip_prefix('-')?;
        let (end, rest) = take_hex(rest)?;
        let rest = rest.strip_prefix(' ')?;

        let (perms, rest) = rest.split_at(4.min(rest.len()));
        if perms.len() != 4 {
            return None;
        }
        let rest = rest.strip_prefix(' ')?;
        let (offset, rest) = take_hex(rest)?;
        let rest = rest.strip_prefix(' ')?;

        // Skip the dev column.
        let dev_end = rest.find(' ')?;
        let rest = &rest[dev_end + 1..];
        let (inode, rest) = take_dec(rest)?;

        let path = rest.trim_start_matches(' ');

        Some(MapRecord {
            start,
            end,
            protection: Protection::from_perms(perms),
            shared: perms.as_bytes()[3] == b's',
            offset,
            inode,
            path,
        })
    }
}

fn take_hex(s: &str) -> Option<(u64, &str)> {
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value = u64::from_str_radix(&s[..end], 16).ok()?;
    Some((value, &s[end..]))
}

fn take_dec(s: &str) -> Option<(u64, &str)> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}
