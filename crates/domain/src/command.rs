//! Command handling: load, decide, append, retry on conflict.

use std::marker::PhantomData;
use std::time::Duration;

use common::AggregateId;
use event_store::{AppendOptions, EventEnvelope, EventStore, EventStoreError, Version, codec};
use futures_util::TryStreamExt;

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::DomainError;

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were persisted. Empty when the command was a no-op.
    pub events: Vec<A::Event>,

    pub new_version: Version,
}

/// An intention to change one aggregate. Not persisted.
pub trait Command: Send + Sync {
    type Aggregate: Aggregate;

    fn aggregate_id(&self) -> AggregateId;

    /// True for commands that start a new aggregate rather than change an
    /// existing one.
    fn creates(&self) -> bool {
        false
    }
}

/// Bounded retry with exponential backoff for appends that lose an
/// optimistic-concurrency race.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Existence {
    MustBeNew,
    MustExist,
}

/// Runs commands against aggregates stored in an [`EventStore`].
///
/// Each attempt replays the aggregate's stream, asks the command function for
/// new events and appends them expecting the version it loaded. When another
/// writer got there first the whole cycle is repeated against fresh state,
/// up to the [`RetryPolicy`] bound.
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    retry: RetryPolicy,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    pub fn new(store: S) -> Self {
        Self::with_retry_policy(store, RetryPolicy::default())
    }

    pub fn with_retry_policy(store: S, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            _phantom: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rebuilds an aggregate by replaying its stream.
    ///
    /// An aggregate with no events comes back in its default state.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        let mut stream = self.store.load(&A::stream_id(aggregate_id)).await?;
        let mut aggregate = A::default();

        while let Some(envelope) = stream.try_next().await? {
            let event: A::Event = codec::decode(
                &envelope.payload,
                envelope.schema_version,
                A::Event::SCHEMA_VERSION,
            )?;
            aggregate.apply_versioned(event, envelope.version);
        }

        Ok(aggregate)
    }

    /// Loads an aggregate, failing with `NotFound` if it has no events.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        let aggregate = self.load(aggregate_id).await?;
        if !aggregate.exists() {
            return Err(DomainError::NotFound {
                aggregate_type: A::aggregate_type(),
                aggregate_id,
            });
        }
        Ok(aggregate)
    }

    /// Runs a creation command. Fails with `AlreadyExists` if the aggregate
    /// has any events.
    pub async fn create<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error> + Send + Sync,
        DomainError: From<A::Error>,
    {
        self.run(aggregate_id, Existence::MustBeNew, command_fn)
            .await
    }

    /// Runs a command against an existing aggregate. Fails with `NotFound`
    /// if the aggregate has no events.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error> + Send + Sync,
        DomainError: From<A::Error>,
    {
        self.run(aggregate_id, Existence::MustExist, command_fn)
            .await
    }

    /// Runs `command_fn` against the aggregate `command` targets: as a
    /// creation when [`Command::creates`] says so, otherwise against an
    /// existing aggregate.
    pub async fn dispatch<C, F>(
        &self,
        command: &C,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        C: Command<Aggregate = A>,
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error> + Send + Sync,
        DomainError: From<A::Error>,
    {
        let existence = if command.creates() {
            Existence::MustBeNew
        } else {
            Existence::MustExist
        };
        self.run(command.aggregate_id(), existence, command_fn)
            .await
    }

    async fn run<F>(
        &self,
        aggregate_id: AggregateId,
        existence: Existence,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error> + Send + Sync,
        DomainError: From<A::Error>,
    {
        let stream_id = A::stream_id(aggregate_id);
        let mut attempt = 1;

        loop {
            let mut aggregate = self.load(aggregate_id).await?;
            match existence {
                Existence::MustBeNew if aggregate.exists() => {
                    return Err(DomainError::AlreadyExists {
                        aggregate_type: A::aggregate_type(),
                        aggregate_id,
                    });
                }
                Existence::MustExist if !aggregate.exists() => {
                    return Err(DomainError::NotFound {
                        aggregate_type: A::aggregate_type(),
                        aggregate_id,
                    });
                }
                _ => {}
            }

            let current_version = aggregate.version();
            let events = command_fn(&aggregate)?;

            if events.is_empty() {
                return Ok(CommandResult {
                    aggregate,
                    events,
                    new_version: current_version,
                });
            }

            let envelopes = self.build_envelopes(aggregate_id, current_version, &events)?;
            let options = AppendOptions::expect_version(current_version);

            match self.store.append(&stream_id, envelopes, options).await {
                Ok(new_version) => {
                    aggregate.apply_events(events.iter().cloned());
                    metrics::counter!("commands_executed").increment(1);
                    tracing::debug!(
                        aggregate_type = A::aggregate_type(),
                        %aggregate_id,
                        %new_version,
                        "command applied"
                    );
                    return Ok(CommandResult {
                        aggregate,
                        events,
                        new_version,
                    });
                }
                Err(EventStoreError::ConcurrencyConflict { actual, .. })
                    if attempt < self.retry.max_attempts =>
                {
                    let delay = self.retry.delay_for_retry(attempt);
                    metrics::counter!("command_conflict_retries").increment(1);
                    tracing::warn!(
                        aggregate_type = A::aggregate_type(),
                        %aggregate_id,
                        expected = %current_version,
                        %actual,
                        attempt,
                        ?delay,
                        "concurrency conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(EventStoreError::ConcurrencyConflict { .. }) => {
                    return Err(DomainError::Conflict {
                        aggregate_id,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn build_envelopes(
        &self,
        aggregate_id: AggregateId,
        current_version: Version,
        events: &[A::Event],
    ) -> Result<Vec<EventEnvelope>, DomainError> {
        let mut version = current_version;

        events
            .iter()
            .map(|event| -> Result<EventEnvelope, DomainError> {
                version = version.next();
                Ok(EventEnvelope::builder()
                    .aggregate_id(aggregate_id)
                    .aggregate_type(A::aggregate_type())
                    .event_type(event.event_type())
                    .version(version)
                    .payload(event)?
                    .schema_version(A::Event::SCHEMA_VERSION)
                    .build()?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use event_store::{EventStoreExt, EventStream, InMemoryEventStore, StreamId};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum NoteEvent {
        Written { text: String },
        Edited { text: String },
    }

    impl DomainEvent for NoteEvent {
        fn event_type(&self) -> &'static str {
            match self {
                NoteEvent::Written { .. } => "NoteWritten",
                NoteEvent::Edited { .. } => "NoteEdited",
            }
        }
    }

    #[derive(Debug, Default)]
    struct Note {
        id: Option<AggregateId>,
        text: String,
        version: Version,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("text must not be empty")]
    struct EmptyText;

    impl From<EmptyText> for DomainError {
        fn from(_: EmptyText) -> Self {
            DomainError::Order(crate::order::OrderError::ValidationFailed(
                crate::order::ValidationError::Blank("text"),
            ))
        }
    }

    impl Aggregate for Note {
        type Event = NoteEvent;
        type Error = EmptyText;

        fn aggregate_type() -> &'static str {
            "Note"
        }

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn apply(&mut self, event: Self::Event) {
            match event {
                NoteEvent::Written { text } => {
                    self.id = Some(AggregateId::new());
                    self.text = text;
                }
                NoteEvent::Edited { text } => self.text = text,
            }
        }
    }

    struct WriteNote(AggregateId);

    impl Command for WriteNote {
        type Aggregate = Note;

        fn aggregate_id(&self) -> AggregateId {
            self.0
        }

        fn creates(&self) -> bool {
            true
        }
    }

    struct EditNote(AggregateId);

    impl Command for EditNote {
        type Aggregate = Note;

        fn aggregate_id(&self) -> AggregateId {
            self.0
        }
    }

    fn write(text: &str) -> impl Fn(&Note) -> Result<Vec<NoteEvent>, EmptyText> + Send + Sync {
        let text = text.to_string();
        move |_| {
            if text.is_empty() {
                return Err(EmptyText);
            }
            Ok(vec![NoteEvent::Written { text: text.clone() }])
        }
    }

    fn edit(text: &str) -> impl Fn(&Note) -> Result<Vec<NoteEvent>, EmptyText> + Send + Sync {
        let text = text.to_string();
        move |_| Ok(vec![NoteEvent::Edited { text: text.clone() }])
    }

    /// Fails the first `conflicts` appends as if another writer had won.
    struct ContendedStore {
        inner: InMemoryEventStore,
        conflicts: AtomicUsize,
    }

    impl ContendedStore {
        fn new(conflicts: usize) -> Self {
            Self {
                inner: InMemoryEventStore::new(),
                conflicts: AtomicUsize::new(conflicts),
            }
        }
    }

    #[async_trait]
    impl EventStore for ContendedStore {
        async fn append(
            &self,
            stream_id: &StreamId,
            events: Vec<EventEnvelope>,
            options: AppendOptions,
        ) -> event_store::Result<Version> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id: stream_id.clone(),
                    expected: options.expected_version.unwrap_or_default(),
                    actual: Version::new(99),
                });
            }
            self.inner.append(stream_id, events, options).await
        }

        async fn load(&self, stream_id: &StreamId) -> event_store::Result<EventStream> {
            self.inner.load(stream_id).await
        }

        async fn stream_version(&self, stream_id: &StreamId) -> event_store::Result<Option<Version>> {
            self.inner.stream_version(stream_id).await
        }

        async fn read_all(&self, prefixes: &[String]) -> event_store::Result<EventStream> {
            self.inner.read_all(prefixes).await
        }
    }

    #[tokio::test]
    async fn create_then_execute() {
        let handler: CommandHandler<_, Note> = CommandHandler::new(InMemoryEventStore::new());
        let id = AggregateId::new();

        let created = handler.create(id, write("hello")).await.unwrap();
        assert_eq!(created.new_version, Version::first());
        assert_eq!(created.aggregate.text, "hello");

        let edited = handler.execute(id, edit("bye")).await.unwrap();
        assert_eq!(edited.new_version, Version::new(2));
        assert_eq!(edited.aggregate.version(), Version::new(2));

        let reloaded = handler.load_existing(id).await.unwrap();
        assert_eq!(reloaded.text, "bye");
        assert_eq!(reloaded.version(), Version::new(2));
    }

    #[tokio::test]
    async fn dispatch_follows_the_command() {
        let handler: CommandHandler<_, Note> = CommandHandler::new(InMemoryEventStore::new());
        let id = AggregateId::new();

        assert!(matches!(
            handler.dispatch(&EditNote(id), edit("early")).await,
            Err(DomainError::NotFound { .. })
        ));

        let created = handler.dispatch(&WriteNote(id), write("hello")).await.unwrap();
        assert_eq!(created.new_version, Version::first());
        assert!(matches!(
            handler.dispatch(&WriteNote(id), write("again")).await,
            Err(DomainError::AlreadyExists { .. })
        ));

        let edited = handler.dispatch(&EditNote(id), edit("bye")).await.unwrap();
        assert_eq!(edited.new_version, Version::new(2));
        assert_eq!(edited.aggregate.text, "bye");
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let handler: CommandHandler<_, Note> = CommandHandler::new(InMemoryEventStore::new());
        let id = AggregateId::new();
        handler.create(id, write("a")).await.unwrap();

        let result = handler.create(id, write("b")).await;
        assert!(matches!(result, Err(DomainError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn execute_on_missing_aggregate_is_not_found() {
        let handler: CommandHandler<_, Note> = CommandHandler::new(InMemoryEventStore::new());
        let result = handler.execute(AggregateId::new(), edit("x")).await;
        assert!(matches!(result, Err(DomainError::NotFound { .. })));
        assert!(matches!(
            handler.load_existing(AggregateId::new()).await,
            Err(DomainError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_command_appends_nothing() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Note> = CommandHandler::new(store.clone());
        let result = handler.create(AggregateId::new(), write("")).await;
        assert!(result.is_err());
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn empty_event_list_skips_append() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Note> = CommandHandler::new(store.clone());
        let id = AggregateId::new();
        handler.create(id, write("a")).await.unwrap();

        let result = handler.execute(id, |_| Ok(vec![])).await.unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.new_version, Version::first());
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn conflict_is_retried_until_append_succeeds() {
        let store = Arc::new(ContendedStore::new(2));
        let handler: CommandHandler<_, Note> = CommandHandler::new(store.clone());
        let id = AggregateId::new();

        let result = handler.create(id, write("eventually")).await.unwrap();
        assert_eq!(result.new_version, Version::first());
        assert_eq!(store.inner.event_count().await, 1);
    }

    #[tokio::test]
    async fn conflict_after_last_attempt_is_reported() {
        let store = Arc::new(ContendedStore::new(5));
        let handler: CommandHandler<_, Note> = CommandHandler::new(store.clone());
        let id = AggregateId::new();

        let result = handler.create(id, write("never")).await;
        assert!(matches!(
            result,
            Err(DomainError::Conflict { attempts: 3, .. })
        ));
        assert!(!store.inner.stream_exists(&Note::stream_id(id)).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_is_surfaced() {
        let store = InMemoryEventStore::new();
        store.set_unavailable(true).await;
        let handler: CommandHandler<_, Note> = CommandHandler::new(store);
        let result = handler.create(AggregateId::new(), write("a")).await;
        assert!(matches!(result, Err(DomainError::StoreUnavailable(_))));
    }

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for_retry(10), Duration::from_millis(200));
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }
}
