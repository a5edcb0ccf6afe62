//! Keeps the projection engine running for the lifetime of the service.

use std::time::{Duration, Instant};

use domain::RetryPolicy;
use event_store::PersistentSubscriptions;
use projections::{Projection, ProjectionEngine};
use tokio::sync::watch;

/// Backoff between engine restarts.
pub fn restart_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: u32::MAX,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
    }
}

/// Runs `engine` until `shutdown` fires, restarting it with exponential
/// backoff whenever it stops with an error (a dropped subscription, an
/// unreachable store, a failed worker).
///
/// The backoff resets once a run has stayed up longer than the policy's
/// maximum delay.
#[tracing::instrument(skip_all, fields(group = %engine.config().consumer_group))]
pub async fn supervise<S, P>(
    engine: ProjectionEngine<S, P>,
    mut shutdown: watch::Receiver<bool>,
    policy: RetryPolicy,
) where
    S: PersistentSubscriptions,
    P: Projection + 'static,
{
    let mut restarts = 0u32;

    loop {
        let started = Instant::now();
        let error = match engine.run(shutdown.clone()).await {
            Ok(()) => break,
            Err(e) => e,
        };

        if *shutdown.borrow() {
            break;
        }
        if started.elapsed() > policy.max_delay {
            restarts = 0;
        }
        restarts = restarts.saturating_add(1);

        let delay = policy.delay_for_retry(restarts);
        metrics::counter!("projection_restarts").increment(1);
        tracing::warn!(error = %error, restarts, ?delay, "projection engine stopped, restarting");

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!("projection supervisor stopped");
}
