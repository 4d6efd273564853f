/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::io;

use syscalls::Errno;
use thiserror::Error;

/// The error type shared by every fallible operation in this crate.
///
/// Operations that the kernel may refuse for policy reasons surface
/// [`Error::PermissionDenied`] so that callers can distinguish a hardened
/// host from a plain lookup miss.
#[derive(Error, Debug)]
pub enum Error {
    /// A file, module, thread, or symbol was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The OS denied access (dumpability, ptrace scope, file modes).
    #[error("permission denied")]
    PermissionDenied,

    /// An unrecognized architecture or ELF encoding was encountered.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// A generic kernel-reported failure.
    #[error(transparent)]
    Failed(#[from] Errno),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            _ => Error::Failed(Errno::new(err.raw_os_error().unwrap_or(libc::EIO))),
        }
    }
}
