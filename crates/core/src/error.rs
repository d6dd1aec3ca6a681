//! Error types for the Tephra storage core
//!
//! This module defines the unified error type used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Error Categories
//!
//! - **Invalid argument**: caller violated a precondition; no side effect occurred
//! - **Not found**: lookup missed everywhere; not an internal failure
//! - **Resource exhausted**: a bounded queue or budget was exceeded
//! - **I/O**: a file, fsync, or directory operation failed
//! - **Corruption**: on-disk data failed framing or decode checks
//! - **Internal**: invariant violation inside the engine

use std::io;
use thiserror::Error;

/// Result type alias for Tephra operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Tephra storage core
#[derive(Debug, Error)]
pub enum Error {
    /// Caller violated a precondition (e.g. empty label name)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Lookup missed in every cache level and the cold store
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bounded resource (queue slot, byte budget) was exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// I/O error (file operations, fsync, directory scans)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption detected on disk
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a missed lookup.
    ///
    /// Read paths treat `NotFound` as a normal outcome, not a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error indicates on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Check if this error is retryable by the caller.
    ///
    /// I/O failures and exhausted queues may succeed on retry; precondition
    /// violations and corruption will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ResourceExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_error_display_invalid_argument() {
        let err = Error::InvalidArgument("label name cannot be empty".to_string());
        assert!(err.to_string().contains("Invalid argument"));
    }

    #[test]
    fn test_error_display_corruption() {
        let err = Error::Corruption("implausible record length".to_string());
        assert!(err.to_string().contains("Corruption"));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("series".to_string()).is_not_found());
        assert!(!Error::Internal("oops".to_string()).is_not_found());
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::ResourceExhausted("queue full".to_string()).is_retryable());
        assert!(Error::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_retryable());
        assert!(!Error::Corruption("bad frame".to_string()).is_retryable());
        assert!(!Error::InvalidArgument("empty".to_string()).is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        fn fails() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }
}
