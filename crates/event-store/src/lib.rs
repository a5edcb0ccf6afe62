//! Append-only event storage with optimistic concurrency and persistent
//! subscriptions.

pub mod codec;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod subscription;

pub use codec::CodecError;
pub use common::{AggregateId, StreamId};
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, MissingField, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream};
pub use subscription::{
    DeliveredEvent, NackAction, ParkedEvent, PersistentSubscription, PersistentSubscriptions,
    SubscriptionHandle, SubscriptionSettings,
};
