//! Error types for Taproot.

use thiserror::Error;

/// Result type alias using TaprootError.
pub type Result<T> = std::result::Result<T, TaprootError>;

/// Errors that can occur in Taproot operations.
#[derive(Debug, Error)]
pub enum TaprootError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // Header page errors
    #[error("Header page full, unable to insert record")]
    HeaderPageFull,

    #[error("Record already exists: {0}")]
    RecordAlreadyExists(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // B+ tree errors
    #[error("B+ tree corrupted: {0}")]
    TreeCorrupted(String),

    // Configuration errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
