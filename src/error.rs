//! Error types for the indexer

use std::path::PathBuf;
use thiserror::Error;

/// Error kinds that can occur while scanning or maintaining the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanErrorKind {
    /// Permission denied when accessing a file or directory
    PermissionDenied,
    /// File or directory not found
    NotFound,
    /// I/O error during file operations
    IoError,
    /// Catalog operation failed
    DatabaseError,
    /// Hash computation failed
    HashError,
    /// Path is not inside any album root, or has an invalid encoding
    InvalidPath,
    /// Schema creation or migration failed
    SchemaError,
    /// The operation was stopped through its observer
    Cancelled,
    /// Unknown error
    Unknown,
}

/// Represents an error that occurred during scanning
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message} (path: {path:?})")]
pub struct ScanError {
    /// The kind of error
    pub kind: ScanErrorKind,
    /// The path where the error occurred
    pub path: Option<PathBuf>,
    /// Human-readable error message
    pub message: String,
}

impl ScanError {
    /// Create a new scan error
    pub fn new(kind: ScanErrorKind, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(path: PathBuf) -> Self {
        Self::new(
            ScanErrorKind::NotFound,
            Some(path.clone()),
            format!("Not found: {:?}", path),
        )
    }

    /// Create an I/O error
    pub fn io_error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::IoError, path, message)
    }

    /// Create a database error
    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::DatabaseError, None, message)
    }

    /// Create a hash computation error
    pub fn hash_error(path: PathBuf, message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::HashError, Some(path), message)
    }

    /// Create an error for a path outside every album root
    pub fn invalid_path(path: PathBuf) -> Self {
        Self::new(
            ScanErrorKind::InvalidPath,
            Some(path.clone()),
            format!("Not inside an album root: {:?}", path),
        )
    }

    /// Create a schema error
    pub fn schema_error(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::SchemaError, None, message)
    }

    /// Create a cancellation error
    pub fn cancelled() -> Self {
        Self::new(ScanErrorKind::Cancelled, None, "Operation cancelled")
    }

    /// Attach a path to an error that has none
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    /// Whether the error was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind == ScanErrorKind::Cancelled
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => ScanErrorKind::PermissionDenied,
            std::io::ErrorKind::NotFound => ScanErrorKind::NotFound,
            _ => ScanErrorKind::IoError,
        };
        Self::new(kind, None, err.to_string())
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        Self::database_error(err.to_string())
    }
}

impl From<walkdir::Error> for ScanError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf());
        let kind = if err.io_error().map(|e| e.kind()) == Some(std::io::ErrorKind::PermissionDenied)
        {
            ScanErrorKind::PermissionDenied
        } else {
            ScanErrorKind::IoError
        };
        Self::new(kind, path, err.to_string())
    }
}
