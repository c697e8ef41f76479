//! Error types shared across the core crate.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the sync engine itself.
///
/// Expected outcomes (offline, version conflict, degraded capture) are not
/// errors; they are represented as typed results on the operations that can
/// produce them.
#[derive(Debug, Error)]
pub enum Error {
    /// Local device storage failed in a way that is not a capability degrade.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A snapshot source rejected a fetch or upsert.
    #[error("data source '{name}' failed: {message}")]
    DataSource { name: String, message: String },
}

impl Error {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn data_source(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataSource {
            name: name.into(),
            message: message.into(),
        }
    }
}
