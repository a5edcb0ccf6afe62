use thiserror::Error;

use crate::{StreamId, Version, codec::CodecError};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream was not at the version the writer expected. Nothing was
    /// written.
    #[error(
        "Concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        stream_id: StreamId,
        expected: Version,
        actual: Version,
    },

    /// The batch handed to `append` is malformed (empty, mixed streams, or
    /// non-sequential versions).
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// The backing store cannot be reached.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The persistent subscription session ended. Consumers must reconnect.
    #[error("Subscription {group} dropped: {reason}")]
    SubscriptionDropped { group: String, reason: String },

    #[error("Subscription group not found: {0}")]
    SubscriptionNotFound(String),
}

impl EventStoreError {
    /// True for transport and storage faults, as opposed to logical outcomes
    /// such as a version conflict.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_))
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
