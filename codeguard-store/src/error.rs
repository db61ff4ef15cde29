//! Error types for codeguard-store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A guarded write found the row in a state other than the one expected.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid stored value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
