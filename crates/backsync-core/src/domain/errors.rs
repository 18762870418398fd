//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures of job definitions and identifier parsing.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Unknown watch mode value
    #[error("Invalid watch mode: {0}")]
    InvalidMode(String),

    /// Polling interval is zero or out of range
    #[error("Invalid polling interval: {0}")]
    InvalidInterval(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("relative/dir".to_string());
        assert_eq!(err.to_string(), "Invalid path: relative/dir");

        let err = DomainError::InvalidMode("3".to_string());
        assert_eq!(err.to_string(), "Invalid watch mode: 3");

        let err = DomainError::InvalidInterval("0".to_string());
        assert_eq!(err.to_string(), "Invalid polling interval: 0");
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidPath("/path".to_string());
        let err2 = DomainError::InvalidPath("/path".to_string());
        let err3 = DomainError::InvalidPath("/other".to_string());

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
