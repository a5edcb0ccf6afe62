use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{AggregateId, StreamId, codec};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Position of an event within its stream, used for optimistic concurrency.
///
/// An empty stream is at version 0; the first event carries version 1 and
/// every later event increments by exactly one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of a stream with no events.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Version carried by the first event of a stream.
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A stored event together with everything needed to route and decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,

    /// Stream the event was appended to, `{aggregate_type}-{aggregate_id}`.
    pub stream_id: StreamId,

    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "Order").
    pub aggregate_type: String,

    /// The type tag of the payload (e.g., "OrderCreated").
    pub event_type: String,

    /// Version of the stream after this event.
    pub version: Version,

    pub timestamp: DateTime<Utc>,

    /// Encoded payload, see [`crate::codec`].
    pub payload: Vec<u8>,

    /// Schema version the payload was encoded with.
    pub schema_version: u32,

    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }
}

#[derive(Debug, Error)]
#[error("Missing required envelope field: {0}")]
pub struct MissingField(pub &'static str);

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    stream_id: Option<StreamId>,
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<Vec<u8>>,
    schema_version: Option<u32>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Overrides the stream. Defaults to the name derived from the aggregate.
    pub fn stream_id(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Encodes and sets the payload.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, codec::CodecError> {
        self.payload = Some(codec::encode(payload)?);
        Ok(self)
    }

    /// Sets already-encoded payload bytes.
    pub fn payload_bytes(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Defaults to 1.
    pub fn schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = Some(schema_version);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the envelope, naming the first missing required field on failure.
    pub fn build(self) -> Result<EventEnvelope, MissingField> {
        let aggregate_id = self.aggregate_id.ok_or(MissingField("aggregate_id"))?;
        let aggregate_type = self.aggregate_type.ok_or(MissingField("aggregate_type"))?;
        let stream_id = self
            .stream_id
            .unwrap_or_else(|| StreamId::for_aggregate(&aggregate_type, aggregate_id));

        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            stream_id,
            aggregate_id,
            aggregate_type,
            event_type: self.event_type.ok_or(MissingField("event_type"))?,
            version: self.version.ok_or(MissingField("version"))?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload.ok_or(MissingField("payload"))?,
            schema_version: self.schema_version.unwrap_or(1),
            metadata: self.metadata,
        })
    }

    /// Tries to build the event envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        self.build().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn builder_derives_stream_from_aggregate() {
        let aggregate_id = AggregateId::new();

        let envelope = EventEnvelope::builder()
            .event_type("OrderPaid")
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .version(Version::new(2))
            .payload(&serde_json::json!({"type": "OrderPaid"}))
            .unwrap()
            .metadata("correlation_id", serde_json::json!("123"))
            .build()
            .unwrap();

        assert_eq!(envelope.stream_id, StreamId::for_aggregate("Order", aggregate_id));
        assert_eq!(envelope.schema_version, 1);
        assert_eq!(envelope.version, Version::new(2));
        assert_eq!(
            envelope.metadata.get("correlation_id"),
            Some(&serde_json::json!("123"))
        );
    }

    #[test]
    fn builder_keeps_explicit_stream() {
        let envelope = EventEnvelope::builder()
            .stream_id(StreamId::new("Custom-1"))
            .event_type("Something")
            .aggregate_id(AggregateId::new())
            .aggregate_type("Order")
            .version(Version::first())
            .payload_bytes(b"{}".to_vec())
            .schema_version(3)
            .build()
            .unwrap();

        assert_eq!(envelope.stream_id.as_str(), "Custom-1");
        assert_eq!(envelope.schema_version, 3);
    }

    #[test]
    fn build_names_missing_field() {
        let err = EventEnvelope::builder()
            .aggregate_id(AggregateId::new())
            .aggregate_type("Order")
            .build()
            .unwrap_err();
        assert_eq!(err.0, "event_type");
        assert!(EventEnvelope::builder().try_build().is_none());
    }
}
