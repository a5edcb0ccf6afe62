//! Domain error types.

use common::AggregateId;
use event_store::{CodecError, EventStoreError, MissingField};
use thiserror::Error;

use crate::order::OrderError;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The order rejected the command (validation or illegal transition).
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("{aggregate_type} {aggregate_id} already exists")]
    AlreadyExists {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    #[error("{aggregate_type} {aggregate_id} not found")]
    NotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// Every attempt lost the optimistic-concurrency race.
    #[error("Concurrent modification of {aggregate_id}: gave up after {attempts} attempts")]
    Conflict {
        aggregate_id: AggregateId,
        attempts: u32,
    },

    #[error("Event store unavailable: {0}")]
    StoreUnavailable(EventStoreError),

    #[error("Event store error: {0}")]
    EventStore(EventStoreError),

    #[error("Stored event could not be decoded: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Envelope(#[from] MissingField),
}

impl From<EventStoreError> for DomainError {
    fn from(e: EventStoreError) -> Self {
        match e {
            EventStoreError::Codec(codec) => DomainError::Codec(codec),
            e if e.is_unavailable() => DomainError::StoreUnavailable(e),
            e => DomainError::EventStore(e),
        }
    }
}

impl DomainError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::NotFound { .. })
    }
}
