//! Error types for obsmem

use crate::provider::ProviderError;
use thiserror::Error;

/// Main error type for the memory pipeline
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed while opening a store
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Storage contract violated or backend unavailable
    #[error("Storage error: {0}")]
    Storage(String),

    /// Provider call failed (only surfaced from explicit, caller-driven passes)
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Invalid threshold, budget or timeout
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    /// Whether the error came from persistence rather than configuration or providers
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            MemoryError::Database(_) | MemoryError::Migration(_) | MemoryError::Storage(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MemoryError>;
