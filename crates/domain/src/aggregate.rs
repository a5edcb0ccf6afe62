//! Core aggregate and domain event traits.

use common::{AggregateId, StreamId};
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// Facts recorded by an aggregate, named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Schema version written into every envelope. Readers refuse payloads
    /// with any other version.
    const SCHEMA_VERSION: u32 = 1;

    /// Returns the event type name stored alongside the payload.
    fn event_type(&self) -> &'static str;
}

/// An event-sourced aggregate.
///
/// State is only ever changed through [`Aggregate::apply`]; command methods
/// validate against the current state and return the events to record.
pub trait Aggregate: Default + Send + Sync + Sized {
    type Event: DomainEvent;

    type Error: std::error::Error + Send + Sync;

    /// Aggregate type name, also the prefix of its stream names.
    fn aggregate_type() -> &'static str;

    /// Returns None until the creation event has been applied.
    fn id(&self) -> Option<AggregateId>;

    /// Version of the last applied event, 0 for a fresh aggregate.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    /// Applies an event to the aggregate, updating its state.
    ///
    /// Must be deterministic and must not fail: events are facts that have
    /// already happened.
    fn apply(&mut self, event: Self::Event);

    fn stream_id(id: AggregateId) -> StreamId {
        StreamId::for_aggregate(Self::aggregate_type(), id)
    }

    /// True once at least one event has been applied.
    fn exists(&self) -> bool {
        self.version() > Version::initial()
    }

    /// Applies an event recorded at `version`.
    ///
    /// Events at or below the current version were already applied and are
    /// ignored, so redelivering a stream never double-applies. Returns
    /// whether the event changed the aggregate.
    fn apply_versioned(&mut self, event: Self::Event, version: Version) -> bool {
        if version <= self.version() {
            return false;
        }
        self.apply(event);
        self.set_version(version);
        true
    }

    /// Applies freshly produced events, assigning them the next versions.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            let next = self.version().next();
            self.apply_versioned(event, next);
        }
    }
}
