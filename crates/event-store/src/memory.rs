use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{
    EventEnvelope, EventStoreError, Result, StreamId, Version,
    store::{AppendOptions, EventStore, EventStream, check_stream_version, validate_events_for_append},
    subscription::{
        DeliveredEvent, NackAction, ParkedEvent, PersistentSubscription, PersistentSubscriptions,
        SubscriptionHandle, SubscriptionSettings,
    },
};

/// In-memory event store with persistent subscription support.
///
/// Used by tests and by the service when no database is configured. Clones
/// share the same log.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    log: Vec<EventEnvelope>,
    /// Indexes into `log`, per stream, in version order.
    streams: HashMap<StreamId, Vec<usize>>,
    groups: HashMap<String, GroupState>,
    next_connection: u64,
    unavailable: bool,
}

struct GroupState {
    settings: SubscriptionSettings,
    /// Next log index to scan for fresh deliveries.
    cursor: usize,
    /// Positions waiting for redelivery.
    retry: VecDeque<Redelivery>,
    in_flight: HashMap<u64, InFlight>,
    parked: Vec<ParkedEvent>,
    session: u64,
    drop_reason: Option<String>,
}

struct InFlight {
    retry_count: u32,
    connection: u64,
}

struct Redelivery {
    position: u64,
    retry_count: u32,
    /// Not handed out before this instant.
    due: Instant,
}

impl GroupState {
    fn new(settings: SubscriptionSettings) -> Self {
        Self {
            settings,
            cursor: 0,
            retry: VecDeque::new(),
            in_flight: HashMap::new(),
            parked: Vec::new(),
            session: 0,
            drop_reason: None,
        }
    }

    fn next_delivery(&mut self, log: &[EventEnvelope], connection: u64) -> Option<DeliveredEvent> {
        let now = Instant::now();
        let due = self.retry.iter().position(|r| r.due <= now);
        if let Some(Redelivery {
            position,
            retry_count,
            ..
        }) = due.and_then(|index| self.retry.remove(index))
        {
            let event = log.get(position as usize - 1)?.clone();
            self.in_flight.insert(position, InFlight { retry_count, connection });
            return Some(DeliveredEvent {
                event,
                position,
                retry_count,
            });
        }

        while let Some(event) = log.get(self.cursor) {
            self.cursor += 1;
            if self.settings.matches(&event.stream_id) {
                let position = self.cursor as u64;
                self.in_flight.insert(
                    position,
                    InFlight {
                        retry_count: 0,
                        connection,
                    },
                );
                return Some(DeliveredEvent {
                    event: event.clone(),
                    position,
                    retry_count: 0,
                });
            }
        }

        None
    }

    /// Earliest instant a delayed redelivery becomes available.
    fn next_due(&self) -> Option<Instant> {
        self.retry.iter().map(|r| r.due).min()
    }

    /// Moves in-flight deliveries matching `owned` back to the retry queue,
    /// available immediately.
    fn release(&mut self, owned: impl Fn(&InFlight) -> bool) {
        let mut released: Vec<(u64, u32)> = self
            .in_flight
            .iter()
            .filter(|(_, f)| owned(f))
            .map(|(p, f)| (*p, f.retry_count))
            .collect();
        released.sort_unstable();
        let now = Instant::now();
        for (position, retry_count) in released.into_iter().rev() {
            self.in_flight.remove(&position);
            self.retry.push_front(Redelivery {
                position,
                retry_count,
                due: now,
            });
        }
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events in the log.
    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.log.len()
    }

    /// Makes every store operation fail with `Unavailable` until reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Ends the current session of a group, as a broker restart would.
    ///
    /// Every open connection receives `SubscriptionDropped` from its next
    /// `recv`, and un-acked deliveries go back to the queue for whoever
    /// reconnects.
    pub async fn drop_subscription(&self, group: &str, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| EventStoreError::SubscriptionNotFound(group.to_string()))?;
        state.session += 1;
        state.drop_reason = Some(reason.to_string());
        state.release(|_| true);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn parked_events(&self, group: &str) -> Vec<ParkedEvent> {
        self.inner
            .lock()
            .await
            .groups
            .get(group)
            .map(|g| g.parked.clone())
            .unwrap_or_default()
    }

    /// Deliveries handed out but neither acked nor nacked yet.
    pub async fn in_flight_count(&self, group: &str) -> usize {
        self.inner
            .lock()
            .await
            .groups
            .get(group)
            .map(|g| g.in_flight.len())
            .unwrap_or_default()
    }

    fn ensure_available(inner: &Inner) -> Result<()> {
        if inner.unavailable {
            return Err(EventStoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        validate_events_for_append(stream_id, &events)?;

        let mut inner = self.inner.lock().await;
        Self::ensure_available(&inner)?;

        let actual = inner
            .streams
            .get(stream_id)
            .map(|idx| Version::new(idx.len() as i64))
            .unwrap_or(Version::initial());
        check_stream_version(stream_id, &options, actual, events[0].version)?;

        let count = events.len();
        let mut last_version = actual;
        for event in events {
            last_version = event.version;
            let index = inner.log.len();
            inner.log.push(event);
            inner.streams.entry(stream_id.clone()).or_default().push(index);
        }
        drop(inner);

        metrics::counter!("events_appended").increment(count as u64);
        self.notify.notify_waiters();
        Ok(last_version)
    }

    async fn load(&self, stream_id: &StreamId) -> Result<EventStream> {
        let inner = self.inner.lock().await;
        Self::ensure_available(&inner)?;

        let events: Vec<EventEnvelope> = inner
            .streams
            .get(stream_id)
            .map(|idx| idx.iter().map(|i| inner.log[*i].clone()).collect())
            .unwrap_or_default();

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<Option<Version>> {
        let inner = self.inner.lock().await;
        Self::ensure_available(&inner)?;
        Ok(inner
            .streams
            .get(stream_id)
            .map(|idx| Version::new(idx.len() as i64)))
    }

    async fn read_all(&self, prefixes: &[String]) -> Result<EventStream> {
        let inner = self.inner.lock().await;
        Self::ensure_available(&inner)?;

        let events: Vec<EventEnvelope> = inner
            .log
            .iter()
            .filter(|e| e.stream_id.matches_any(prefixes))
            .cloned()
            .collect();

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}

#[async_trait]
impl PersistentSubscriptions for InMemoryEventStore {
    async fn create_subscription(
        &self,
        group: &str,
        settings: SubscriptionSettings,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::ensure_available(&inner)?;
        if inner.groups.contains_key(group) {
            tracing::debug!(group, "subscription group already exists");
            return Ok(());
        }
        inner
            .groups
            .insert(group.to_string(), GroupState::new(settings));
        tracing::info!(group, "created subscription group");
        Ok(())
    }

    async fn connect(&self, group: &str) -> Result<SubscriptionHandle> {
        let mut inner = self.inner.lock().await;
        Self::ensure_available(&inner)?;
        let session = inner
            .groups
            .get(group)
            .map(|g| g.session)
            .ok_or_else(|| EventStoreError::SubscriptionNotFound(group.to_string()))?;
        inner.next_connection += 1;

        Ok(Arc::new(InMemorySubscription {
            store: self.clone(),
            group: group.to_string(),
            connection: inner.next_connection,
            session,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection to a group hosted by [`InMemoryEventStore`].
pub struct InMemorySubscription {
    store: InMemoryEventStore,
    group: String,
    connection: u64,
    session: u64,
    closed: AtomicBool,
}

impl InMemorySubscription {
    fn dropped(&self, reason: impl Into<String>) -> EventStoreError {
        EventStoreError::SubscriptionDropped {
            group: self.group.clone(),
            reason: reason.into(),
        }
    }

    /// Returns the group state if this connection is still part of the live
    /// session.
    fn live_group<'a>(&self, groups: &'a mut HashMap<String, GroupState>) -> Result<&'a mut GroupState> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.dropped("connection closed"));
        }
        let state = groups
            .get_mut(&self.group)
            .ok_or_else(|| self.dropped("subscription group deleted"))?;
        if state.session != self.session {
            let reason = state
                .drop_reason
                .clone()
                .unwrap_or_else(|| "session ended".to_string());
            return Err(self.dropped(reason));
        }
        Ok(state)
    }
}

#[async_trait]
impl PersistentSubscription for InMemorySubscription {
    fn group(&self) -> &str {
        &self.group
    }

    async fn recv(&self) -> Result<DeliveredEvent> {
        loop {
            let notified = self.store.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut inner = self.store.inner.lock().await;
                let Inner { log, groups, .. } = &mut *inner;
                let state = self.live_group(groups)?;
                if let Some(delivered) = state.next_delivery(log, self.connection) {
                    return Ok(delivered);
                }
                state.next_due()
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivered: &DeliveredEvent) -> Result<()> {
        let mut inner = self.store.inner.lock().await;
        let state = self.live_group(&mut inner.groups)?;
        state.in_flight.remove(&delivered.position);
        Ok(())
    }

    async fn nack(&self, delivered: &DeliveredEvent, action: NackAction, reason: &str) -> Result<()> {
        let mut inner = self.store.inner.lock().await;
        let state = self.live_group(&mut inner.groups)?;
        let Some(flight) = state.in_flight.remove(&delivered.position) else {
            return Ok(());
        };

        let park = match action {
            NackAction::Skip => return Ok(()),
            NackAction::Park => true,
            NackAction::Retry => {
                let retry_count = flight.retry_count + 1;
                if retry_count > state.settings.max_retry_count {
                    true
                } else {
                    state.retry.push_back(Redelivery {
                        position: delivered.position,
                        retry_count,
                        due: Instant::now() + state.settings.retry_delay(retry_count),
                    });
                    false
                }
            }
        };

        if park {
            tracing::warn!(
                group = %self.group,
                position = delivered.position,
                event_type = %delivered.event.event_type,
                reason,
                "parking event"
            );
            state.parked.push(ParkedEvent {
                event: delivered.event.clone(),
                position: delivered.position,
                reason: reason.to_string(),
            });
            return Ok(());
        }

        drop(inner);
        self.store.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.store.inner.lock().await;
        if let Some(state) = inner.groups.get_mut(&self.group)
            && state.session == self.session
        {
            let connection = self.connection;
            state.release(|f| f.connection == connection);
        }
        drop(inner);
        self.store.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::TryStreamExt;

    use super::*;
    use crate::{AggregateId, EventStoreExt};

    fn order_event(id: AggregateId, version: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(id)
            .aggregate_type("Order")
            .event_type(event_type)
            .version(Version::new(version))
            .payload_bytes(br#"{"test":true}"#.to_vec())
            .build()
            .unwrap()
    }

    async fn append_order(store: &InMemoryEventStore, id: AggregateId, versions: &[i64]) {
        let stream = StreamId::for_aggregate("Order", id);
        let events = versions
            .iter()
            .map(|v| order_event(id, *v, "Test"))
            .collect();
        store.append(&stream, events, AppendOptions::any()).await.unwrap();
    }

    #[tokio::test]
    async fn append_and_load_in_version_order() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let stream = StreamId::for_aggregate("Order", id);

        let version = store
            .append(
                &stream,
                vec![order_event(id, 1, "A"), order_event(id, 2, "B")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        assert_eq!(version, Version::new(2));

        let events = store.load_to_vec(&stream).await.unwrap();
        let versions: Vec<_> = events.iter().map(|e| e.version.as_i64()).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(store.stream_version(&stream).await.unwrap(), Some(Version::new(2)));
    }

    #[tokio::test]
    async fn load_of_unknown_stream_is_empty() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::for_aggregate("Order", AggregateId::new());
        assert!(store.load_to_vec(&stream).await.unwrap().is_empty());
        assert!(!store.stream_exists(&stream).await.unwrap());
    }

    #[tokio::test]
    async fn load_is_restartable() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        append_order(&store, id, &[1, 2, 3]).await;
        let stream = StreamId::for_aggregate("Order", id);

        let first: Vec<_> = store.load(&stream).await.unwrap().try_collect().await.unwrap();
        let second: Vec<_> = store.load(&stream).await.unwrap().try_collect().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stale_append_writes_nothing() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let stream = StreamId::for_aggregate("Order", id);
        append_order(&store, id, &[1, 2]).await;

        let result = store
            .append(
                &stream,
                vec![order_event(id, 2, "Stale"), order_event(id, 3, "Stale")],
                AppendOptions::expect_version(Version::first()),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { expected, actual, .. })
                if expected == Version::first() && actual == Version::new(2)
        ));
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn read_all_filters_by_prefix_in_commit_order() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        append_order(&store, a, &[1]).await;
        store
            .append_event(
                &StreamId::new("Customer-1"),
                EventEnvelope::builder()
                    .stream_id(StreamId::new("Customer-1"))
                    .aggregate_id(AggregateId::new())
                    .aggregate_type("Customer")
                    .event_type("CustomerRegistered")
                    .version(Version::first())
                    .payload_bytes(b"{}".to_vec())
                    .build()
                    .unwrap(),
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        append_order(&store, b, &[1]).await;
        append_order(&store, a, &[2]).await;

        let orders: Vec<_> = store
            .read_all(&["Order-".to_string()])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let seen: Vec<_> = orders.iter().map(|e| (e.aggregate_id, e.version.as_i64())).collect();
        assert_eq!(seen, vec![(a, 1), (b, 1), (a, 2)]);

        let everything: Vec<_> = store.read_all(&[]).await.unwrap().try_collect().await.unwrap();
        assert_eq!(everything.len(), 4);
    }

    #[tokio::test]
    async fn unavailable_store_fails_operations() {
        let store = InMemoryEventStore::new();
        store.set_unavailable(true).await;
        let stream = StreamId::for_aggregate("Order", AggregateId::new());
        let err = store.stream_version(&stream).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn subscription_delivers_only_matching_streams() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        append_order(&store, id, &[1]).await;

        let sub = store
            .subscribe_all("g", SubscriptionSettings::new(["Customer-"]))
            .await
            .unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(pending.is_err(), "nothing should match the prefix");
    }

    #[tokio::test]
    async fn ack_removes_delivery() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        append_order(&store, id, &[1, 2]).await;

        let sub = store
            .subscribe_all("g", SubscriptionSettings::new(["Order-"]))
            .await
            .unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.event.version, Version::first());
        assert_eq!(first.position, 1);
        sub.ack(&first).await.unwrap();

        let second = sub.recv().await.unwrap();
        assert_eq!(second.event.version, Version::new(2));
        sub.ack(&second).await.unwrap();
        assert_eq!(store.in_flight_count("g").await, 0);
    }

    #[tokio::test]
    async fn recv_waits_for_new_events() {
        let store = InMemoryEventStore::new();
        let sub = store
            .subscribe_all("g", SubscriptionSettings::new(["Order-"]))
            .await
            .unwrap();

        let writer = store.clone();
        let id = AggregateId::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            append_order(&writer, id, &[1]).await;
        });

        let delivered = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("delivery")
            .unwrap();
        assert_eq!(delivered.event.aggregate_id, id);
    }

    #[tokio::test]
    async fn nack_retry_redelivers_with_incremented_count() {
        let store = InMemoryEventStore::new();
        append_order(&store, AggregateId::new(), &[1]).await;
        let sub = store
            .subscribe_all("g", SubscriptionSettings::new(["Order-"]))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        sub.nack(&first, NackAction::Retry, "boom").await.unwrap();
        let again = sub.recv().await.unwrap();
        assert_eq!(again.position, first.position);
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn nacked_event_waits_for_backoff_while_fresh_events_flow() {
        let store = InMemoryEventStore::new();
        append_order(&store, AggregateId::new(), &[1]).await;
        let sub = store
            .subscribe_all(
                "g",
                SubscriptionSettings::new(["Order-"])
                    .with_retry_backoff(Duration::from_millis(100), Duration::from_secs(1)),
            )
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        let nacked_at = tokio::time::Instant::now();
        sub.nack(&first, NackAction::Retry, "predecessor missing")
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(30), sub.recv())
                .await
                .is_err()
        );

        let later = AggregateId::new();
        append_order(&store, later, &[1]).await;
        let fresh = sub.recv().await.unwrap();
        assert_eq!(fresh.event.aggregate_id, later);
        sub.ack(&fresh).await.unwrap();

        let again = sub.recv().await.unwrap();
        assert_eq!(again.position, first.position);
        assert_eq!(again.retry_count, 1);
        assert!(nacked_at.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_parks_event() {
        let store = InMemoryEventStore::new();
        append_order(&store, AggregateId::new(), &[1]).await;
        let sub = store
            .subscribe_all(
                "g",
                SubscriptionSettings::new(["Order-"]).with_max_retry_count(2),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            let delivered = sub.recv().await.unwrap();
            sub.nack(&delivered, NackAction::Retry, "still failing")
                .await
                .unwrap();
        }

        let parked = store.parked_events("g").await;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].reason, "still failing");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn competing_connections_never_share_a_delivery() {
        let store = InMemoryEventStore::new();
        append_order(&store, AggregateId::new(), &[1]).await;
        append_order(&store, AggregateId::new(), &[1]).await;
        store
            .create_subscription("g", SubscriptionSettings::new(["Order-"]))
            .await
            .unwrap();
        let a = store.connect("g").await.unwrap();
        let b = store.connect("g").await.unwrap();

        let from_a = a.recv().await.unwrap();
        let from_b = b.recv().await.unwrap();
        assert_ne!(from_a.position, from_b.position);
    }

    #[tokio::test]
    async fn closing_a_connection_releases_its_deliveries() {
        let store = InMemoryEventStore::new();
        append_order(&store, AggregateId::new(), &[1]).await;
        store
            .create_subscription("g", SubscriptionSettings::new(["Order-"]))
            .await
            .unwrap();
        let crashed = store.connect("g").await.unwrap();
        let survivor = store.connect("g").await.unwrap();

        let taken = crashed.recv().await.unwrap();
        crashed.close().await.unwrap();

        let redelivered = survivor.recv().await.unwrap();
        assert_eq!(redelivered.position, taken.position);
        assert!(matches!(
            crashed.recv().await,
            Err(EventStoreError::SubscriptionDropped { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_session_fails_recv_and_requeues() {
        let store = InMemoryEventStore::new();
        append_order(&store, AggregateId::new(), &[1]).await;
        let settings = SubscriptionSettings::new(["Order-"]);
        let sub = store.subscribe_all("g", settings.clone()).await.unwrap();
        let taken = sub.recv().await.unwrap();

        store.drop_subscription("g", "server restart").await.unwrap();
        match sub.recv().await {
            Err(EventStoreError::SubscriptionDropped { group, reason }) => {
                assert_eq!(group, "g");
                assert_eq!(reason, "server restart");
            }
            other => panic!("expected SubscriptionDropped, got {other:?}"),
        }

        let reconnected = store.subscribe_all("g", settings).await.unwrap();
        let redelivered = reconnected.recv().await.unwrap();
        assert_eq!(redelivered.position, taken.position);
    }

    #[tokio::test]
    async fn create_subscription_is_idempotent() {
        let store = InMemoryEventStore::new();
        append_order(&store, AggregateId::new(), &[1]).await;
        let sub = store
            .subscribe_all("g", SubscriptionSettings::new(["Order-"]))
            .await
            .unwrap();
        let delivered = sub.recv().await.unwrap();
        sub.ack(&delivered).await.unwrap();

        store
            .create_subscription("g", SubscriptionSettings::new(["Order-"]))
            .await
            .unwrap();
        let again = store.connect("g").await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), again.recv())
                .await
                .is_err(),
            "recreating must not rewind the group"
        );
    }

    #[tokio::test]
    async fn connect_to_unknown_group_fails() {
        let store = InMemoryEventStore::new();
        assert!(matches!(
            store.connect("missing").await,
            Err(EventStoreError::SubscriptionNotFound(_))
        ));
    }
}
