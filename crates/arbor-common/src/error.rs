//! Error types for Arbor.

use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in Arbor operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Invalid configuration value for {name}: {reason}")]
    InvalidConfiguration { name: String, reason: String },

    // Concurrency errors
    #[error("Lock timeout after {timeout_ms} ms")]
    LockTimeout { timeout_ms: i64 },

    // Tree errors
    #[error("Invalid node handle: {0}")]
    InvalidNodeHandle(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Key not found")]
    KeyNotFound,

    #[error("Input is not in ascending order: {0}")]
    OrderViolation(String),

    // Compound file errors
    #[error("Handle not found: {0}")]
    HandleNotFound(u32),

    #[error("Data corrupted at {location}: {reason}")]
    DataCorrupted { location: String, reason: String },

    #[error("Section {section} corrupted: {reason}")]
    SectionCorrupted { section: u32, reason: String },

    #[error("Write of {size} bytes exceeds maximum of {max}")]
    WriteTooLarge { size: usize, max: usize },

    #[error("Storage is read only")]
    ReadOnly,

    // Transaction log errors
    #[error("Transaction log corrupted at offset {offset}: {reason}")]
    LogCorrupted { offset: u64, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Usage errors
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArborError {
    /// Builds an `InvalidConfiguration` error.
    pub fn config(name: &str, reason: impl Into<String>) -> Self {
        ArborError::InvalidConfiguration {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Builds a `DataCorrupted` error.
    pub fn corrupted(location: impl Into<String>, reason: impl Into<String>) -> Self {
        ArborError::DataCorrupted {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for lock timeouts, which the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArborError::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: ArborError = io_err.into();
        assert!(matches!(err, ArborError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ArborError::config("BTreeOrder", "The valid range is from 4 to 256.");
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for BTreeOrder: The valid range is from 4 to 256."
        );
    }

    #[test]
    fn test_lock_timeout_display() {
        let err = ArborError::LockTimeout { timeout_ms: 250 };
        assert_eq!(err.to_string(), "Lock timeout after 250 ms");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_tree_errors_display() {
        let err = ArborError::InvalidNodeHandle("7:42".to_string());
        assert_eq!(err.to_string(), "Invalid node handle: 7:42");

        let err = ArborError::DuplicateKey("\"A\"".to_string());
        assert_eq!(err.to_string(), "Duplicate key: \"A\"");
        assert!(!err.is_retryable());

        let err = ArborError::KeyNotFound;
        assert_eq!(err.to_string(), "Key not found");

        let err = ArborError::OrderViolation("3 after 5".to_string());
        assert_eq!(err.to_string(), "Input is not in ascending order: 3 after 5");
    }

    #[test]
    fn test_compound_file_errors_display() {
        let err = ArborError::HandleNotFound(12);
        assert_eq!(err.to_string(), "Handle not found: 12");

        let err = ArborError::corrupted("block 9", "crc mismatch");
        assert_eq!(err.to_string(), "Data corrupted at block 9: crc mismatch");

        let err = ArborError::SectionCorrupted {
            section: 2,
            reason: "primary copy invalid".to_string(),
        };
        assert_eq!(err.to_string(), "Section 2 corrupted: primary copy invalid");

        let err = ArborError::WriteTooLarge {
            size: 70000,
            max: 65519,
        };
        assert_eq!(err.to_string(), "Write of 70000 bytes exceeds maximum of 65519");

        assert_eq!(ArborError::ReadOnly.to_string(), "Storage is read only");
    }

    #[test]
    fn test_log_errors_display() {
        let err = ArborError::LogCorrupted {
            offset: 128,
            reason: "bad trailer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Transaction log corrupted at offset 128: bad trailer"
        );
    }

    #[test]
    fn test_misc_errors_display() {
        let err = ArborError::Serialization("unexpected end of data".to_string());
        assert_eq!(err.to_string(), "Serialization error: unexpected end of data");

        let err = ArborError::InvalidOperation("rollback with commit-on-write".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid operation: rollback with commit-on-write"
        );

        let err = ArborError::Internal("assertion failed".to_string());
        assert_eq!(err.to_string(), "Internal error: assertion failed");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(ArborError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ArborError>();
    }
}
