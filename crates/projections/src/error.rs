//! Projection error types.

use common::AggregateId;
use event_store::{CodecError, EventStoreError, Version};
use thiserror::Error;

/// Errors raised by read-model stores.
#[derive(Debug, Error)]
pub enum ReadModelError {
    /// An update arrived before the events preceding it were projected.
    #[error("Version gap on order {order_id}: stored {stored}, incoming {incoming}")]
    VersionGap {
        order_id: AggregateId,
        stored: Version,
        incoming: Version,
    },

    /// An update arrived for an order whose creation was not projected yet.
    #[error("Order {order_id} has no document yet (incoming version {incoming})")]
    MissingDocument {
        order_id: AggregateId,
        incoming: Version,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during projection processing.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Event store error: {0}")]
    EventStore(EventStoreError),

    /// The subscription session ended; the engine must be restarted.
    #[error("Subscription {group} dropped: {reason}")]
    SubscriptionDropped { group: String, reason: String },

    #[error("Event decoding error: {0}")]
    Codec(#[from] CodecError),

    #[error("Read model error: {0}")]
    ReadModel(#[from] ReadModelError),

    /// A worker task panicked or was aborted.
    #[error("Projection worker failed: {0}")]
    Worker(String),

    /// A projection-specific error.
    #[error("Projection error: {0}")]
    Projection(String),
}

impl From<EventStoreError> for ProjectionError {
    fn from(e: EventStoreError) -> Self {
        match e {
            EventStoreError::SubscriptionDropped { group, reason } => {
                ProjectionError::SubscriptionDropped { group, reason }
            }
            EventStoreError::Codec(e) => ProjectionError::Codec(e),
            other => ProjectionError::EventStore(other),
        }
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Errors returned by read-side queries.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Order {0} not found")]
    NotFound(AggregateId),

    #[error(transparent)]
    ReadModel(#[from] ReadModelError),
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueryError::NotFound(_))
    }
}
