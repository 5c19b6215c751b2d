// src/error.rs

use thiserror::Error;

/// Core error types for pndstore
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Malformed or unsupported repository document (aborts one source)
    #[error("Format error: {0}")]
    FormatError(String),

    /// A package or archive is missing mandatory data (skips one item)
    #[error("Field error: {0}")]
    FieldError(String),

    /// Unreachable source or failed/timed-out transfer
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Downloaded content does not match the published checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Operation is not valid for the current package state
    #[error("Invalid state: {0}")]
    StateError(String),

    /// Invalid configuration, target directory or table name
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Archive could not be read by the metadata extractor
    #[error("Failed to extract metadata: {0}")]
    ExtractError(String),
}

/// Result type alias using pndstore's Error type
pub type Result<T> = std::result::Result<T, Error>;
