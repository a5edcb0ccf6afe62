//! Projection engine: a pool of workers draining a persistent subscription.

use std::sync::Arc;

use event_store::{
    EventStore, NackAction, PersistentSubscriptions, SubscriptionHandle, SubscriptionSettings,
    subscription::DEFAULT_MAX_RETRY_COUNT,
};
use futures_util::TryStreamExt;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::projection::Projection;
use crate::{ProjectionError, Result};

/// Settings of one projection engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Subscription group shared by every worker.
    pub consumer_group: String,
    /// Stream-name prefixes to project. Empty means every stream.
    pub prefixes: Vec<String>,
    /// Number of concurrent workers.
    pub pool_size: usize,
    /// Retries before the store parks an event.
    pub max_retry_count: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            consumer_group: "order-projection".to_string(),
            prefixes: vec!["Order-".to_string()],
            pool_size: 4,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
        }
    }
}

impl EngineConfig {
    pub fn subscription_settings(&self) -> SubscriptionSettings {
        SubscriptionSettings::new(self.prefixes.clone())
            .with_max_retry_count(self.max_retry_count)
    }
}

/// Feeds events from a persistent subscription into a projection.
///
/// Workers are independent competing consumers on one connection; which
/// worker sees which event is up to the store. A failed `handle` is nacked
/// for retry, a successful one acked.
pub struct ProjectionEngine<S, P> {
    subscriptions: S,
    projection: Arc<P>,
    config: EngineConfig,
}

impl<S, P> ProjectionEngine<S, P>
where
    S: PersistentSubscriptions,
    P: Projection + 'static,
{
    pub fn new(subscriptions: S, projection: Arc<P>, config: EngineConfig) -> Self {
        Self {
            subscriptions,
            projection,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs until `shutdown` turns true (or its sender is dropped), or until
    /// a worker fails.
    ///
    /// Shutdown leaves in-flight events un-acked for the store to redeliver
    /// and returns `Ok(())`. A dropped subscription or any other worker error
    /// stops the remaining workers and is returned.
    #[tracing::instrument(
        skip(self, shutdown),
        fields(group = %self.config.consumer_group, projection = self.projection.name())
    )]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let subscription = self
            .subscriptions
            .subscribe_all(
                &self.config.consumer_group,
                self.config.subscription_settings(),
            )
            .await?;

        let pool_size = self.config.pool_size.max(1);
        tracing::info!(pool_size, "projection engine started");

        let mut workers = JoinSet::new();
        for worker_id in 0..pool_size {
            workers.spawn(worker_loop(
                worker_id,
                subscription.clone(),
                Arc::clone(&self.projection),
                shutdown.clone(),
            ));
        }

        let mut outcome = Ok(());
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(ProjectionError::Worker(e.to_string())),
            };
            if let Err(e) = result
                && outcome.is_ok()
            {
                tracing::error!(error = %e, "projection worker failed, stopping engine");
                workers.abort_all();
                outcome = Err(e);
            }
        }

        if let Err(e) = subscription.close().await {
            tracing::warn!(error = %e, "failed to close subscription");
        }
        tracing::info!(ok = outcome.is_ok(), "projection engine stopped");
        outcome
    }
}

/// Resolves once shutdown was requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn worker_loop<P: Projection>(
    worker_id: usize,
    subscription: SubscriptionHandle,
    projection: Arc<P>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let delivered = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return Ok(()),
            delivered = subscription.recv() => delivered?,
        };

        let handled = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                tracing::debug!(worker_id, position = delivered.position, "shutdown during handle, leaving event un-acked");
                return Ok(());
            }
            handled = projection.handle(&delivered.event) => handled,
        };

        match handled {
            Ok(()) => {
                subscription.ack(&delivered).await?;
                metrics::counter!("projection_events_acked").increment(1);
            }
            Err(e) => {
                tracing::warn!(
                    worker_id,
                    event_type = %delivered.event.event_type,
                    stream_id = %delivered.event.stream_id,
                    retry_count = delivered.retry_count,
                    error = %e,
                    "projection failed, nacking for retry"
                );
                subscription
                    .nack(&delivered, NackAction::Retry, &e.to_string())
                    .await?;
                metrics::counter!("projection_events_nacked").increment(1);
            }
        }
    }
}

/// Resets `projection` and replays every matching event of `store` through
/// it. Returns the number of events replayed.
#[tracing::instrument(skip(store, projection), fields(projection = projection.name()))]
pub async fn rebuild<S, P>(store: &S, projection: &P, prefixes: &[String]) -> Result<u64>
where
    S: EventStore + ?Sized,
    P: Projection + ?Sized,
{
    projection.reset().await?;

    let mut events = store.read_all(prefixes).await?;
    let mut replayed = 0;
    while let Some(event) = events.try_next().await? {
        projection.handle(&event).await?;
        replayed += 1;
    }

    tracing::info!(replayed, "projection rebuilt");
    Ok(replayed)
}
