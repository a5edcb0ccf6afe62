//! Order documents projected from the order event streams.

use async_trait::async_trait;
use domain::order::OrderCreatedData;
use domain::{Aggregate, Order, OrderEvent, OrderStatus};
use event_store::EventEnvelope;

use crate::Result;
use crate::projection::Projection;
use crate::read_model::{OrderDocument, OrderPatch, OrderReadStore, WriteOutcome};

/// Maintains one [`OrderDocument`] per order.
///
/// Creation inserts the document; every later event is a versioned patch.
/// Events from other aggregates, and order event types this build does not
/// know, are acknowledged without effect.
pub struct OrderProjection<R: OrderReadStore> {
    store: R,
}

impl<R: OrderReadStore> OrderProjection<R> {
    pub fn new(store: R) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &R {
        &self.store
    }
}

fn new_document(data: OrderCreatedData, event: &EventEnvelope) -> OrderDocument {
    OrderDocument {
        order_id: data.order_id,
        version: event.version,
        status: OrderStatus::Created,
        total_price: data.shop_items.iter().map(|item| item.total_price()).sum(),
        shop_items: data.shop_items,
        account_email: data.account_email.as_str().to_string(),
        delivery_address: data.delivery_address,
        cancel_reason: None,
        paid_at: None,
        submitted_at: None,
        delivery_started_at: None,
        delivery_timestamp: None,
        canceled_at: None,
        created_at: data.created_at,
        updated_at: event.timestamp,
    }
}

fn skip(event: &EventEnvelope, why: &'static str) {
    metrics::counter!("projection_events_skipped").increment(1);
    tracing::debug!(
        event_type = %event.event_type,
        stream_id = %event.stream_id,
        why,
        "event skipped by order projection"
    );
}

#[async_trait]
impl<R: OrderReadStore> Projection for OrderProjection<R> {
    fn name(&self) -> &'static str {
        "OrderProjection"
    }

    #[tracing::instrument(
        skip(self, event),
        fields(event_type = %event.event_type, version = %event.version)
    )]
    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        if event.aggregate_type != Order::aggregate_type() {
            skip(event, "not an order");
            return Ok(());
        }
        let Some(order_event) = OrderEvent::from_envelope(event)? else {
            skip(event, "unknown event type");
            return Ok(());
        };

        let patch = match order_event {
            OrderEvent::OrderCreated(data) => {
                let outcome = self.store.insert(new_document(data, event)).await?;
                log_outcome(event, outcome);
                return Ok(());
            }
            OrderEvent::OrderPaid(data) => OrderPatch::Paid {
                paid_at: data.paid_at,
            },
            OrderEvent::OrderSubmitted(data) => OrderPatch::Submitted {
                submitted_at: data.submitted_at,
            },
            OrderEvent::OrderDelivering(data) => OrderPatch::DeliveryStarted {
                started_at: data.started_at,
            },
            OrderEvent::OrderDelivered(data) => OrderPatch::Delivered {
                delivery_timestamp: data.delivery_timestamp,
            },
            OrderEvent::OrderCanceled(data) => OrderPatch::Canceled {
                cancel_reason: data.cancel_reason,
                canceled_at: data.canceled_at,
            },
            OrderEvent::OrderUpdated(data) => OrderPatch::ItemsReplaced {
                shop_items: data.shop_items,
            },
            OrderEvent::DeliveryAddressChanged(data) => OrderPatch::DeliveryAddressChanged {
                delivery_address: data.delivery_address,
            },
        };

        let outcome = self
            .store
            .update(event.aggregate_id, event.version, event.timestamp, patch)
            .await?;
        log_outcome(event, outcome);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.store.clear().await?;
        Ok(())
    }
}

fn log_outcome(event: &EventEnvelope, outcome: WriteOutcome) {
    match outcome {
        WriteOutcome::Applied => {
            tracing::debug!(order_id = %event.aggregate_id, "order document updated")
        }
        WriteOutcome::Duplicate => {
            tracing::debug!(order_id = %event.aggregate_id, "duplicate delivery ignored")
        }
    }
}
