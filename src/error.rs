use std::io;
use std::path::PathBuf;

use openssl::error::ErrorStack;

/// The error type used across the crate.
///
/// Reactor calls report descriptor and capacity problems directly; TLS
/// calls wrap the library error stack so that a failed call never leaves
/// queued error state behind for the next one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad argument")]
    BadArgument,
    #[error("out of memory")]
    NoMemory,
    #[error("bad descriptor")]
    BadDescriptor,
    #[error("too many descriptors")]
    TooManyDescriptors,
    #[error("not supported")]
    NotSupported,
    #[error("already bound")]
    AlreadyBound,
    #[error("already polling")]
    AlreadyPolling,
    #[error("not found")]
    NotFound,
    #[error("buffer too small")]
    Overflow,
    #[error("bad format")]
    BadFormat,
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("authentication failure: {0}")]
    AuthFailure(String),
    #[error("protocol error")]
    Protocol,
    #[error("permission denied")]
    Permission,
    #[error("transient failure")]
    Transient,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] ErrorStack),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps an I/O error from a backend attach into the caller-visible kind.
    pub(crate) fn from_attach(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::EBADF) => Error::BadDescriptor,
            Some(libc::ENOMEM) => Error::NoMemory,
            Some(libc::ENOSPC) => Error::TooManyDescriptors,
            Some(libc::EPERM) => Error::Permission,
            _ => Error::Io(err),
        }
    }
}
