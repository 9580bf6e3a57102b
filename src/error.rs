//! Error kinds shared by the data-path handlers and the FUSE boundary.

use crate::store::StoreError;
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// Errors produced by the filesystem core. Local I/O failures keep their OS
/// error codes; store failures are mapped at the FUSE boundary via [`errno`].
///
/// [`errno`]: FsError::errno
#[derive(Debug, Error)]
pub enum FsError {
    /// Virtual paths handed to the translator must be absolute.
    #[error("path is not absolute: {0:?}")]
    InvalidPath(String),

    /// The stub file has no record yet. Transient: a reader may race a
    /// writer that has not released its stream, so callers retry rather
    /// than treating this as a missing file.
    #[error("no object recorded for this file yet")]
    NoObjectYet,

    /// The last line of the stub file did not parse into a record.
    /// Readers degrade this to [`FsError::NoObjectYet`]; it only surfaces
    /// where a caller asked for strict decoding.
    #[error("stub record is malformed")]
    MalformedRecord,

    /// First write to a path arrived at a non-zero offset. Put streams are
    /// append-only from beginning-of-file; resumed writes are not supported.
    #[error("writes must start at offset 0, got offset {0}")]
    UnsupportedWritePattern(u64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("local i/o: {0}")]
    Local(#[from] std::io::Error),
}

impl FsError {
    /// POSIX error code for the kernel-callback boundary.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::InvalidPath(_) => libc::EINVAL,
            FsError::NoObjectYet => libc::EAGAIN,
            FsError::MalformedRecord => libc::EAGAIN,
            FsError::UnsupportedWritePattern(_) => libc::EINVAL,
            FsError::Store(StoreError::ObjectNotFound(_)) => libc::ENOENT,
            FsError::Store(StoreError::UnknownPolicy(_)) => libc::EINVAL,
            FsError::Store(StoreError::Io(_)) => libc::EIO,
            FsError::Local(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
