//! Core projection trait.

use async_trait::async_trait;
use event_store::EventEnvelope;

use crate::Result;

/// A projection that processes events and updates a read model.
///
/// Delivery is at-least-once and events of different streams may arrive in
/// any order, so `handle` must tolerate duplicates. Returning an error makes
/// the engine nack the event for a later retry.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handles a single event, updating the projection's read model.
    async fn handle(&self, event: &EventEnvelope) -> Result<()>;

    /// Resets the projection to its initial state.
    async fn reset(&self) -> Result<()>;
}

#[async_trait]
impl<P: Projection + ?Sized> Projection for std::sync::Arc<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        (**self).handle(event).await
    }

    async fn reset(&self) -> Result<()> {
        (**self).reset().await
    }
}
