//! # Error Taxonomy
//!
//! Every fallible operation in the crate returns [`Result`], whose error
//! side is a structured [`Error`] carrying a code from the wire-visible
//! taxonomy and a human-readable message. Errors are values, never panics;
//! well-formed input cannot crash the engine.
//!
//! ## Recovery Policy
//!
//! | Class | Codes | Policy |
//! |-------|-------|--------|
//! | caller mistakes | InvalidArgument, OutOfRange, KeyTooLarge, ValueTooLarge | surfaced verbatim, no retry |
//! | domain outcomes | NotFound, AlreadyExists | expected, not retried |
//! | fatal for the file | Corruption, ChecksumMismatch, VersionMismatch | the backend refuses further operations on that file; the tree refuses further operations on that root |
//! | transient | IoError, DiskFull, Unavailable | surfaced; callers may retry, the core never retries internally |
//! | broken invariant | Internal | operation abandoned, in-memory state untouched, tree unusable until reopened |

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error with a taxonomy code and message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("i/o error: {0}")]
    IoError(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("page not found: {0}")]
    PageNotFound(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    #[error("value too large: {0}")]
    ValueTooLarge(String),

    #[error("key too large: {0}")]
    KeyTooLarge(String),

    #[error("index version mismatch: {0}")]
    IndexVersionMismatch(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    /// True for the classes that permanently disable the affected
    /// subsystem (file or tree) until it is reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_)
                | Error::ChecksumMismatch(_)
                | Error::VersionMismatch(_)
                | Error::Internal(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull => Error::DiskFull(err.to_string()),
            io::ErrorKind::UnexpectedEof => {
                Error::IoError(format!("short read or write: {err}"))
            }
            _ => Error::IoError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_code_prefix_and_message() {
        let err = Error::Corruption("bad page 7".into());
        assert_eq!(err.to_string(), "corruption detected: bad page 7");

        let err = Error::VersionMismatch("expected 0x00010000".into());
        assert_eq!(err.to_string(), "version mismatch: expected 0x00010000");
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::corruption("x").is_fatal());
        assert!(Error::ChecksumMismatch("x".into()).is_fatal());
        assert!(Error::VersionMismatch("x".into()).is_fatal());
        assert!(Error::internal("x").is_fatal());

        assert!(!Error::NotFound("x".into()).is_fatal());
        assert!(!Error::unavailable("x").is_fatal());
        assert!(!Error::IoError("x".into()).is_fatal());
    }

    #[test]
    fn io_error_conversion_maps_kinds() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from(eof), Error::IoError(_)));

        let other = io::Error::other("boom");
        assert!(matches!(Error::from(other), Error::IoError(_)));
    }
}
