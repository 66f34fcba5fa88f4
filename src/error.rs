use std::io;
use thiserror::Error;

/// Errors produced by every component of this crate.
///
/// The variants follow the failure classes callers need to tell apart: bad caller input,
/// persisted state that cannot be interpreted, data that is shorter or different than its
/// framing says, plain I/O failures (with the OS error preserved), parameter combinations
/// that are not implemented, and failures reported by a signing backend.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("data loss: {0}")]
    DataLoss(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("unsupported parameters: {0}")]
    UnsupportedParams(String),

    #[error("signing backend error: {0}")]
    SigningBackend(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
