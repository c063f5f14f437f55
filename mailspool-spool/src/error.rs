//! Error types for the mailspool-spool crate.

use std::io;

use thiserror::Error;

use crate::types::EntryRef;

/// Top-level spool error type.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (file read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metadata could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Entry not found in the spool.
    #[error("Entry not found: {0}")]
    NotFound(EntryRef),

    /// An entry with the requested id already exists.
    #[error("Entry already exists: {0}")]
    AlreadyExists(EntryRef),

    /// Identifier, path or configuration validation failed.
    #[error("Spool validation error: {0}")]
    Validation(#[from] ValidationError),

    /// File watcher error.
    #[error("File watcher error: {0}")]
    WatchError(String),

    /// Internal error (capacity, lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Validation errors for identifiers, folder paths and spool directories.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid entry id {id:?}: {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("Invalid spool path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Spool directory path is not a directory.
    #[error("Spool path is not a directory: {0}")]
    NotDirectory(String),

    /// Invalid spool configuration.
    #[error("Invalid spool configuration: {0}")]
    InvalidConfiguration(String),
}

/// Specialized `Result` type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

impl<T> From<std::sync::PoisonError<T>> for SpoolError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

impl From<bincode::error::EncodeError> for SpoolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<bincode::error::DecodeError> for SpoolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<notify::Error> for SpoolError {
    fn from(e: notify::Error) -> Self {
        Self::WatchError(e.to_string())
    }
}
