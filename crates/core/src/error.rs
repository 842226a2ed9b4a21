//! Error types for the queue coordination layer
//!
//! This module defines the error type shared by every crate in the workspace.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::io;
use thiserror::Error;

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the queue coordination layer
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (open, create, map, flush)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Data corruption detected in a mapped file
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A bounded wait did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Shorthand for [`Error::Corruption`]
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Shorthand for [`Error::InvalidOperation`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::IoError(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
    }

    #[test]
    fn test_error_display_corruption() {
        let err = Error::corruption("bad table magic");
        let msg = err.to_string();
        assert!(msg.contains("Data corruption"));
        assert!(msg.contains("bad table magic"));
    }

    #[test]
    fn test_error_display_invalid_operation() {
        let err = Error::invalid("key too long");
        let msg = err.to_string();
        assert!(msg.contains("Invalid operation"));
        assert!(msg.contains("key too long"));
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout("table initialisation".to_string());
        assert!(err.to_string().contains("Timed out"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::IoError(_)));
    }
}
