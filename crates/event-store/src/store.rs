use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{EventEnvelope, EventStoreError, Result, StreamId, Version};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Version the stream must be at for the append to succeed. `None` skips
    /// the check; the batch must still continue the stream without gaps.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Expects the stream to be empty.
    pub fn expect_new() -> Self {
        Self::expect_version(Version::initial())
    }
}

/// A lazy stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Append-only log of versioned streams.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to a stream atomically: either all are written or none.
    ///
    /// Fails with `ConcurrencyConflict` when `options.expected_version` is set
    /// and differs from the stream's current version. Returns the version of
    /// the stream after the append.
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version>;

    /// Streams the events of one stream in ascending version order.
    ///
    /// A stream that was never written yields nothing. The returned stream is
    /// independent of the store borrow, so calling `load` again restarts the
    /// read from the first event.
    async fn load(&self, stream_id: &StreamId) -> Result<EventStream>;

    /// Current version of a stream, `None` if it holds no events.
    async fn stream_version(&self, stream_id: &StreamId) -> Result<Option<Version>>;

    /// Streams every event whose stream matches one of `prefixes`, in global
    /// commit order. An empty prefix list selects every stream.
    async fn read_all(&self, prefixes: &[String]) -> Result<EventStream>;
}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        (**self).append(stream_id, events, options).await
    }

    async fn load(&self, stream_id: &StreamId) -> Result<EventStream> {
        (**self).load(stream_id).await
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<Option<Version>> {
        (**self).stream_version(stream_id).await
    }

    async fn read_all(&self, prefixes: &[String]) -> Result<EventStream> {
        (**self).read_all(prefixes).await
    }
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    async fn append_event(
        &self,
        stream_id: &StreamId,
        event: EventEnvelope,
        options: AppendOptions,
    ) -> Result<Version> {
        self.append(stream_id, vec![event], options).await
    }

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool> {
        Ok(self.stream_version(stream_id).await?.is_some())
    }

    /// Loads a whole stream into memory.
    async fn load_to_vec(&self, stream_id: &StreamId) -> Result<Vec<EventEnvelope>> {
        self.load(stream_id).await?.try_collect().await
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Checks the shape of a batch: non-empty, all for `stream_id`, and
/// sequential versions.
pub fn validate_events_for_append(stream_id: &StreamId, events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty batch".to_string(),
        ));
    };

    if let Some(stray) = events.iter().find(|e| &e.stream_id != stream_id) {
        return Err(EventStoreError::InvalidAppend(format!(
            "event {} belongs to stream {}, not {}",
            stray.event_id, stray.stream_id, stream_id
        )));
    }

    let mut expected = first.version;
    for event in events.iter().skip(1) {
        expected = expected.next();
        if event.version != expected {
            return Err(EventStoreError::InvalidAppend(format!(
                "event versions must be sequential: expected {expected}, got {}",
                event.version
            )));
        }
    }

    Ok(())
}

/// Checks a validated batch against the stream's current version.
///
/// Without an expected version the batch must still start right after
/// `actual`; a batch that doesn't lost a race with another writer and is
/// reported as a conflict too.
pub fn check_stream_version(
    stream_id: &StreamId,
    options: &AppendOptions,
    actual: Version,
    first_new: Version,
) -> Result<()> {
    let expected = options
        .expected_version
        .unwrap_or(Version::new(first_new.as_i64() - 1));

    if expected != actual {
        return Err(EventStoreError::ConcurrencyConflict {
            stream_id: stream_id.clone(),
            expected,
            actual,
        });
    }

    if first_new != actual.next() {
        return Err(EventStoreError::InvalidAppend(format!(
            "first event version {first_new} does not follow stream version {actual}"
        )));
    }

    Ok(())
}
