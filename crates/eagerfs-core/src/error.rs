// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the EagerFS engine

use std::io;

use libc::{EBADF, EINVAL, EIO, EOPNOTSUPP};

/// Engine error type. `Io` carries the errno from a relayed syscall; the
/// remaining variants are engine-level conditions.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad handle")]
    BadHandle,
    #[error("unsupported")]
    Unsupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// The errno this error surfaces as at the kernel boundary.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::InvalidArgument => EINVAL,
            FsError::BadHandle => EBADF,
            FsError::Unsupported => EOPNOTSUPP,
            FsError::Io(err) => err.raw_os_error().unwrap_or(EIO),
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        FsError::Io(io::Error::from_raw_os_error(errno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_surface_their_errno() {
        let err = FsError::from_errno(libc::ENOENT);
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn engine_errors_map_to_stable_errnos() {
        assert_eq!(FsError::BadHandle.errno(), EBADF);
        assert_eq!(FsError::InvalidArgument.errno(), EINVAL);
        assert_eq!(FsError::Unsupported.errno(), EOPNOTSUPP);
    }
}
