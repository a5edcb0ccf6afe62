//! Persistent (competing-consumer) subscriptions over the global event log.
//!
//! A subscription group is created once and remembered by the store. Any
//! number of connections may attach to a group; the store decides which
//! connection receives which event, and tracks for every delivery whether it
//! was acknowledged, is due for a retry, or was parked. Delivery is
//! at-least-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{EventEnvelope, Result, StreamId};

/// Retry budget applied when no explicit value is configured.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;

/// Delay before the first redelivery of a nacked event.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound of the redelivery delay.
pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Settings of a subscription group, fixed when the group is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSettings {
    /// Stream-name prefixes to deliver. Empty means every stream.
    pub prefixes: Vec<String>,
    /// Number of retries before an event is parked.
    pub max_retry_count: u32,
    /// How long a delivery may stay un-acked before another connection may
    /// receive it.
    pub message_timeout: Duration,
    /// Delay before the first redelivery of a nacked event. Doubles with every
    /// further retry up to `max_retry_backoff`.
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            message_timeout: Duration::from_secs(30),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
        }
    }
}

impl SubscriptionSettings {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    pub fn with_message_timeout(mut self, message_timeout: Duration) -> Self {
        self.message_timeout = message_timeout;
        self
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_retry_backoff = max;
        self
    }

    /// How long an event nacked for the `retry_count`-th time (1-based) stays
    /// invisible before it is redelivered.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }

    pub fn matches(&self, stream_id: &StreamId) -> bool {
        stream_id.matches_any(&self.prefixes)
    }
}

/// What the store should do with an event the consumer failed to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Redeliver later. Parks the event once the retry budget is spent.
    Retry,
    /// Set the event aside without redelivering it.
    Park,
    /// Drop the delivery as if it had been acknowledged.
    Skip,
}

/// One delivery of an event to a connection.
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub event: EventEnvelope,
    /// Position of the event in the global log.
    pub position: u64,
    /// How many times the event was nacked for retry before this delivery.
    pub retry_count: u32,
}

/// An event the group gave up on.
#[derive(Debug, Clone)]
pub struct ParkedEvent {
    pub event: EventEnvelope,
    pub position: u64,
    pub reason: String,
}

/// A connection to a subscription group, shareable across worker tasks.
#[async_trait]
pub trait PersistentSubscription: Send + Sync {
    fn group(&self) -> &str;

    /// Waits for the next delivery.
    ///
    /// Fails with `SubscriptionDropped` once the session ends; the handle is
    /// unusable afterwards. Cancel-safe: dropping the future before it
    /// completes never loses an event.
    async fn recv(&self) -> Result<DeliveredEvent>;

    /// Marks a delivery as handled. Acking an unknown delivery is a no-op.
    async fn ack(&self, delivered: &DeliveredEvent) -> Result<()>;

    async fn nack(&self, delivered: &DeliveredEvent, action: NackAction, reason: &str) -> Result<()>;

    /// Ends this connection. Its un-acked deliveries become available to
    /// other connections.
    async fn close(&self) -> Result<()>;
}

pub type SubscriptionHandle = Arc<dyn PersistentSubscription>;

/// Stores that can host persistent subscription groups.
#[async_trait]
pub trait PersistentSubscriptions: Send + Sync {
    /// Creates the group. Creating a group that already exists succeeds and
    /// leaves the existing group untouched.
    async fn create_subscription(&self, group: &str, settings: SubscriptionSettings)
    -> Result<()>;

    /// Attaches a new connection to an existing group.
    async fn connect(&self, group: &str) -> Result<SubscriptionHandle>;

    /// Creates the group if needed, then connects to it.
    async fn subscribe_all(
        &self,
        group: &str,
        settings: SubscriptionSettings,
    ) -> Result<SubscriptionHandle> {
        self.create_subscription(group, settings).await?;
        self.connect(group).await
    }
}
