//! Error types for CirrusKV
//!
//! Provides a unified error type for all operations.
//!
//! ## Taxonomy
//! - NotFound: `KeyNotFound`, `ObjectNotFound` (expected, never retried)
//! - InvalidArgument: `InvalidArgument`, `InvalidColumnFamily`, `Config`
//! - IOError: `Io`, `Storage`
//! - CloudTransportError: `CloudTransport` (retried internally, then surfaced)
//! - Corruption: `WalCorruption`, `ManifestCorruption`, `TableCorruption`

use thiserror::Error;

/// Result type alias using CirrusError
pub type Result<T> = std::result::Result<T, CirrusError>;

/// Unified error type for CirrusKV operations
#[derive(Debug, Error)]
pub enum CirrusError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    KeyNotFound,

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid column family: {0}")]
    InvalidColumnFamily(String),

    #[error("Database is not open")]
    Closed,

    // -------------------------------------------------------------------------
    // Corruption Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("Manifest corruption detected: {0}")]
    ManifestCorruption(String),

    #[error("Table corruption detected: {0}")]
    TableCorruption(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Background error: {0}")]
    Background(String),

    // -------------------------------------------------------------------------
    // Cloud Errors
    // -------------------------------------------------------------------------
    #[error("Cloud transport error: {0}")]
    CloudTransport(String),

    #[error("Cloud object not found: {0}")]
    ObjectNotFound(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CirrusError {
    /// True for the NotFound class (missing key or missing remote object)
    pub fn is_not_found(&self) -> bool {
        matches!(self, CirrusError::KeyNotFound | CirrusError::ObjectNotFound(_))
    }

    /// True for caller errors that must not be retried
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            CirrusError::InvalidArgument(_)
                | CirrusError::InvalidColumnFamily(_)
                | CirrusError::Config(_)
        )
    }

    /// True for integrity failures that need operator intervention
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CirrusError::WalCorruption(_)
                | CirrusError::ManifestCorruption(_)
                | CirrusError::TableCorruption(_)
        )
    }

    /// True for transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, CirrusError::CloudTransport(_) | CirrusError::Io(_))
    }
}

impl From<bincode::Error> for CirrusError {
    fn from(e: bincode::Error) -> Self {
        CirrusError::Serialization(e.to_string())
    }
}

impl From<object_store::Error> for CirrusError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => CirrusError::ObjectNotFound(path),
            other => CirrusError::CloudTransport(other.to_string()),
        }
    }
}
