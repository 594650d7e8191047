use thiserror::Error;

use crate::{CorrelationId, Version};

/// Errors that can occur when interacting with the instance store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrency conflict occurred when updating an instance.
    /// The expected version did not match the stored version.
    #[error(
        "Concurrency conflict for saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// The instance was not found in the store.
    #[error("Saga instance not found: {0}")]
    NotFound(CorrelationId),

    /// The record handed to `update` does not carry the next version.
    #[error("Saga {correlation_id} must be written at version {expected}, got {actual}")]
    InvalidVersion {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for optimistic-write collisions.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for instance store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
