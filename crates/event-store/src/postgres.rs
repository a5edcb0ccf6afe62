use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventStoreError, Result, StreamId, Version,
    store::{AppendOptions, EventStore, EventStream, check_stream_version, validate_events_for_append},
    subscription::{
        DeliveredEvent, NackAction, ParkedEvent, PersistentSubscription, PersistentSubscriptions,
        SubscriptionHandle, SubscriptionSettings,
    },
};

const PAGE_SIZE: i64 = 256;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Advisory lock held by every append transaction until it commits, so
/// `global_position` values become visible in the order they were assigned.
/// Subscription cursors rely on that to never step over an uncommitted event.
const APPEND_LOCK_KEY: i64 = 0x6576_656e_7473;

const EVENT_COLUMNS: &str = "global_position, id, stream_id, event_type, aggregate_id, \
     aggregate_type, version, timestamp, payload, schema_version, metadata";

/// PostgreSQL-backed event store with persistent subscription support.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long an idle subscription waits before polling for new events.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Events a group gave up on, oldest first.
    pub async fn parked_events(&self, group: &str) -> Result<Vec<ParkedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT e.global_position, e.id, e.stream_id, e.event_type, e.aggregate_id,
                   e.aggregate_type, e.version, e.timestamp, e.payload, e.schema_version,
                   e.metadata, m.last_error
            FROM subscription_messages m
            JOIN events e ON e.global_position = m.global_position
            WHERE m.group_name = $1 AND m.parked
            ORDER BY m.global_position ASC
            "#,
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ParkedEvent> {
                Ok(ParkedEvent {
                    event: row_to_event(row)?,
                    position: row.try_get::<i64, _>("global_position")? as u64,
                    reason: row
                        .try_get::<Option<String>, _>("last_error")?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}

fn row_to_event(row: &PgRow) -> Result<EventEnvelope> {
    let metadata_json: serde_json::Value = row.try_get("metadata")?;
    let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

    Ok(EventEnvelope {
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
        stream_id: StreamId::new(row.try_get::<String, _>("stream_id")?),
        aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: row.try_get("event_type")?,
        version: Version::new(row.try_get("version")?),
        timestamp: row.try_get("timestamp")?,
        payload: row.try_get("payload")?,
        schema_version: row.try_get::<i32, _>("schema_version")? as u32,
        metadata,
    })
}

/// Turns stream-name prefixes into `LIKE` patterns.
fn like_patterns(prefixes: &[String]) -> Vec<String> {
    prefixes
        .iter()
        .map(|p| {
            let escaped = p
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("{escaped}%")
        })
        .collect()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

enum PageSource {
    Stream(StreamId),
    All(Vec<String>),
}

/// Reads a query page by page as the consumer pulls, so large streams never
/// sit in memory at once.
struct Pager {
    pool: PgPool,
    source: PageSource,
    after: i64,
    buffer: VecDeque<EventEnvelope>,
    exhausted: bool,
}

impl Pager {
    fn new(pool: PgPool, source: PageSource) -> Self {
        Self {
            pool,
            source,
            after: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let rows = match &self.source {
            PageSource::Stream(stream_id) => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events \
                     WHERE stream_id = $1 AND version > $2 \
                     ORDER BY version ASC LIMIT $3"
                ))
                .bind(stream_id.as_str())
                .bind(self.after)
                .bind(PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
            }
            PageSource::All(patterns) => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events \
                     WHERE global_position > $1 \
                       AND (cardinality($2::text[]) = 0 OR stream_id LIKE ANY($2)) \
                     ORDER BY global_position ASC LIMIT $3"
                ))
                .bind(self.after)
                .bind(patterns)
                .bind(PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
            }
        };

        if (rows.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }

        for row in &rows {
            let event = row_to_event(row)?;
            self.after = match self.source {
                PageSource::Stream(_) => event.version.as_i64(),
                PageSource::All(_) => row.try_get("global_position")?,
            };
            self.buffer.push_back(event);
        }
        Ok(())
    }

    fn into_stream(self) -> EventStream {
        Box::pin(stream::unfold(Some(self), |state| async move {
            let mut pager = state?;
            if pager.buffer.is_empty() && !pager.exhausted {
                if let Err(e) = pager.fetch_page().await {
                    return Some((Err(e), None));
                }
            }
            let event = pager.buffer.pop_front()?;
            Some((Ok(event), Some(pager)))
        }))
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        validate_events_for_append(stream_id, &events)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_one(&mut *tx)
                .await?;
        let actual = Version::new(current.unwrap_or(0));
        check_stream_version(stream_id, &options, actual, events[0].version)?;

        let mut last_version = actual;
        for event in &events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO events (id, stream_id, event_type, aggregate_id, aggregate_type,
                                    version, timestamp, payload, schema_version, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(event.stream_id.as_str())
            .bind(&event.event_type)
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(event.version.as_i64())
            .bind(event.timestamp)
            .bind(&event.payload)
            .bind(event.schema_version as i32)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A concurrent writer committed the same version first.
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_stream_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        stream_id: stream_id.clone(),
                        expected: actual,
                        actual: event.version,
                    };
                }
                EventStoreError::Database(e)
            })?;

            last_version = event.version;
        }

        tx.commit().await?;
        metrics::counter!("events_appended").increment(events.len() as u64);
        Ok(last_version)
    }

    async fn load(&self, stream_id: &StreamId) -> Result<EventStream> {
        Ok(Pager::new(self.pool.clone(), PageSource::Stream(stream_id.clone())).into_stream())
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn read_all(&self, prefixes: &[String]) -> Result<EventStream> {
        let source = PageSource::All(like_patterns(prefixes));
        Ok(Pager::new(self.pool.clone(), source).into_stream())
    }
}

#[async_trait]
impl PersistentSubscriptions for PostgresEventStore {
    async fn create_subscription(
        &self,
        group: &str,
        settings: SubscriptionSettings,
    ) -> Result<()> {
        let created = sqlx::query(
            r#"
            INSERT INTO persistent_subscriptions
                (group_name, prefixes, max_retry_count, message_timeout_ms,
                 retry_backoff_ms, max_retry_backoff_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (group_name) DO NOTHING
            "#,
        )
        .bind(group)
        .bind(&settings.prefixes)
        .bind(settings.max_retry_count as i32)
        .bind(millis(settings.message_timeout))
        .bind(millis(settings.retry_backoff))
        .bind(millis(settings.max_retry_backoff))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if created == 0 {
            tracing::debug!(group, "subscription group already exists");
        } else {
            tracing::info!(group, "created subscription group");
        }
        Ok(())
    }

    async fn connect(&self, group: &str) -> Result<SubscriptionHandle> {
        let row = sqlx::query(
            r#"
            SELECT prefixes, max_retry_count, message_timeout_ms,
                   retry_backoff_ms, max_retry_backoff_ms
            FROM persistent_subscriptions
            WHERE group_name = $1
            "#,
        )
        .bind(group)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EventStoreError::SubscriptionNotFound(group.to_string()))?;

        let duration = |column: &str| -> Result<Duration> {
            let ms: i64 = row.try_get(column)?;
            Ok(Duration::from_millis(ms.max(0) as u64))
        };
        let settings = SubscriptionSettings {
            prefixes: row.try_get("prefixes")?,
            max_retry_count: row.try_get::<i32, _>("max_retry_count")?.max(0) as u32,
            message_timeout: duration("message_timeout_ms")?,
            retry_backoff: duration("retry_backoff_ms")?,
            max_retry_backoff: duration("max_retry_backoff_ms")?,
        };

        Ok(Arc::new(PostgresSubscription {
            pool: self.pool.clone(),
            group: group.to_string(),
            connection_id: Uuid::new_v4(),
            patterns: like_patterns(&settings.prefixes),
            settings,
            poll_interval: self.poll_interval,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection to a group stored in PostgreSQL.
///
/// Deliveries are leases: a delivered row becomes visible again once
/// `message_timeout` passes without an ack, so a crashed process never
/// strands an event.
pub struct PostgresSubscription {
    pool: PgPool,
    group: String,
    connection_id: Uuid,
    patterns: Vec<String>,
    settings: SubscriptionSettings,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl PostgresSubscription {
    fn message_timeout_ms(&self) -> i64 {
        millis(self.settings.message_timeout)
    }

    fn dropped(&self, reason: impl Into<String>) -> EventStoreError {
        EventStoreError::SubscriptionDropped {
            group: self.group.clone(),
            reason: reason.into(),
        }
    }

    async fn load_event(
        tx: &mut Transaction<'_, Postgres>,
        position: i64,
    ) -> Result<EventEnvelope> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE global_position = $1"
        ))
        .bind(position)
        .fetch_one(&mut **tx)
        .await?;
        row_to_event(&row)
    }

    /// Claims the next delivery: an expired or nacked message first, then the
    /// next unseen event of the group.
    async fn try_claim(&self) -> Result<Option<DeliveredEvent>> {
        let mut tx = self.pool.begin().await?;

        let redelivery = sqlx::query(
            r#"
            UPDATE subscription_messages
            SET visible_at = now() + ($2 * interval '1 millisecond'), connection_id = $3
            WHERE (group_name, global_position) = (
                SELECT group_name, global_position
                FROM subscription_messages
                WHERE group_name = $1 AND NOT parked AND visible_at <= now()
                ORDER BY global_position ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING global_position, retry_count
            "#,
        )
        .bind(&self.group)
        .bind(self.message_timeout_ms())
        .bind(self.connection_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = redelivery {
            let position: i64 = row.try_get("global_position")?;
            let retry_count: i32 = row.try_get("retry_count")?;
            let event = Self::load_event(&mut tx, position).await?;
            tx.commit().await?;
            return Ok(Some(DeliveredEvent {
                event,
                position: position as u64,
                retry_count: retry_count as u32,
            }));
        }

        let last_position: Option<i64> = sqlx::query_scalar(
            "SELECT last_position FROM persistent_subscriptions WHERE group_name = $1 FOR UPDATE",
        )
        .bind(&self.group)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(last_position) = last_position else {
            return Err(self.dropped("subscription group deleted"));
        };

        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE global_position > $1 \
               AND (cardinality($2::text[]) = 0 OR stream_id LIKE ANY($2)) \
             ORDER BY global_position ASC LIMIT 1"
        ))
        .bind(last_position)
        .bind(&self.patterns)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let position: i64 = row.try_get("global_position")?;
        let event = row_to_event(&row)?;

        sqlx::query("UPDATE persistent_subscriptions SET last_position = $2 WHERE group_name = $1")
            .bind(&self.group)
            .bind(position)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO subscription_messages (group_name, global_position, visible_at, connection_id)
            VALUES ($1, $2, now() + ($3 * interval '1 millisecond'), $4)
            "#,
        )
        .bind(&self.group)
        .bind(position)
        .bind(self.message_timeout_ms())
        .bind(self.connection_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(DeliveredEvent {
            event,
            position: position as u64,
            retry_count: 0,
        }))
    }
}

#[async_trait]
impl PersistentSubscription for PostgresSubscription {
    fn group(&self) -> &str {
        &self.group
    }

    async fn recv(&self) -> Result<DeliveredEvent> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(self.dropped("connection closed"));
            }
            match self.try_claim().await {
                Ok(Some(delivered)) => return Ok(delivered),
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(EventStoreError::SubscriptionDropped { group, reason }) => {
                    return Err(EventStoreError::SubscriptionDropped { group, reason });
                }
                Err(e) => return Err(self.dropped(e.to_string())),
            }
        }
    }

    async fn ack(&self, delivered: &DeliveredEvent) -> Result<()> {
        sqlx::query(
            "DELETE FROM subscription_messages WHERE group_name = $1 AND global_position = $2",
        )
        .bind(&self.group)
        .bind(delivered.position as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn nack(&self, delivered: &DeliveredEvent, action: NackAction, reason: &str) -> Result<()> {
        let position = delivered.position as i64;
        let parked = match action {
            NackAction::Skip => {
                return self.ack(delivered).await;
            }
            NackAction::Park => {
                sqlx::query(
                    r#"
                    UPDATE subscription_messages SET parked = TRUE, last_error = $3
                    WHERE group_name = $1 AND global_position = $2
                    "#,
                )
                .bind(&self.group)
                .bind(position)
                .bind(reason)
                .execute(&self.pool)
                .await?;
                true
            }
            NackAction::Retry => sqlx::query_scalar::<_, bool>(
                r#"
                UPDATE subscription_messages
                SET retry_count = retry_count + 1,
                    parked = retry_count + 1 > $4,
                    visible_at = now() + ($5 * interval '1 millisecond'),
                    connection_id = NULL,
                    last_error = $3
                WHERE group_name = $1 AND global_position = $2
                RETURNING parked
                "#,
            )
            .bind(&self.group)
            .bind(position)
            .bind(reason)
            .bind(self.settings.max_retry_count as i32)
            .bind(millis(self.settings.retry_delay(delivered.retry_count + 1)))
            .fetch_optional(&self.pool)
            .await?
            .unwrap_or(false),
        };

        if parked {
            tracing::warn!(
                group = %self.group,
                position,
                event_type = %delivered.event.event_type,
                reason,
                "parking event"
            );
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE subscription_messages SET visible_at = now(), connection_id = NULL
            WHERE group_name = $1 AND connection_id = $2 AND NOT parked
            "#,
        )
        .bind(&self.group)
        .bind(self.connection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
