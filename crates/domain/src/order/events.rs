//! Order domain events.

use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::{CodecError, EventEnvelope, codec};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::{AccountEmail, ShopItem};

/// Every event type an order stream may contain.
pub const ORDER_EVENT_TYPES: [&str; 8] = [
    "OrderCreated",
    "OrderPaid",
    "OrderSubmitted",
    "OrderDelivering",
    "OrderDelivered",
    "OrderCanceled",
    "OrderUpdated",
    "DeliveryAddressChanged",
];

/// Events that can occur on an order aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    OrderCreated(OrderCreatedData),
    OrderPaid(OrderPaidData),
    OrderSubmitted(OrderSubmittedData),
    /// The order left the warehouse.
    OrderDelivering(OrderDeliveringData),
    OrderDelivered(OrderDeliveredData),
    OrderCanceled(OrderCanceledData),
    /// The shop items were replaced.
    OrderUpdated(OrderUpdatedData),
    DeliveryAddressChanged(DeliveryAddressChangedData),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "OrderCreated",
            OrderEvent::OrderPaid(_) => "OrderPaid",
            OrderEvent::OrderSubmitted(_) => "OrderSubmitted",
            OrderEvent::OrderDelivering(_) => "OrderDelivering",
            OrderEvent::OrderDelivered(_) => "OrderDelivered",
            OrderEvent::OrderCanceled(_) => "OrderCanceled",
            OrderEvent::OrderUpdated(_) => "OrderUpdated",
            OrderEvent::DeliveryAddressChanged(_) => "DeliveryAddressChanged",
        }
    }
}

impl OrderEvent {
    /// Decodes an order event from a stored envelope.
    ///
    /// Returns `Ok(None)` for event types this build does not know, so
    /// consumers can skip them instead of failing.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Option<Self>, CodecError> {
        if !ORDER_EVENT_TYPES.contains(&envelope.event_type.as_str()) {
            return Ok(None);
        }
        codec::decode(
            &envelope.payload,
            envelope.schema_version,
            Self::SCHEMA_VERSION,
        )
        .map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: AggregateId,
    pub shop_items: Vec<ShopItem>,
    pub account_email: AccountEmail,
    #[serde(default)]
    pub delivery_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPaidData {
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmittedData {
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDeliveringData {
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDeliveredData {
    pub delivery_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCanceledData {
    pub cancel_reason: String,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdatedData {
    pub shop_items: Vec<ShopItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAddressChangedData {
    pub delivery_address: String,
}

impl OrderEvent {
    pub fn order_created(
        order_id: AggregateId,
        shop_items: Vec<ShopItem>,
        account_email: AccountEmail,
        delivery_address: Option<String>,
    ) -> Self {
        OrderEvent::OrderCreated(OrderCreatedData {
            order_id,
            shop_items,
            account_email,
            delivery_address,
            created_at: Utc::now(),
        })
    }

    pub fn order_paid() -> Self {
        OrderEvent::OrderPaid(OrderPaidData {
            paid_at: Utc::now(),
        })
    }

    pub fn order_submitted() -> Self {
        OrderEvent::OrderSubmitted(OrderSubmittedData {
            submitted_at: Utc::now(),
        })
    }

    pub fn order_delivering() -> Self {
        OrderEvent::OrderDelivering(OrderDeliveringData {
            started_at: Utc::now(),
        })
    }

    pub fn order_delivered(delivery_timestamp: DateTime<Utc>) -> Self {
        OrderEvent::OrderDelivered(OrderDeliveredData { delivery_timestamp })
    }

    pub fn order_canceled(cancel_reason: impl Into<String>) -> Self {
        OrderEvent::OrderCanceled(OrderCanceledData {
            cancel_reason: cancel_reason.into(),
            canceled_at: Utc::now(),
        })
    }

    pub fn order_updated(shop_items: Vec<ShopItem>) -> Self {
        OrderEvent::OrderUpdated(OrderUpdatedData { shop_items })
    }

    pub fn delivery_address_changed(delivery_address: impl Into<String>) -> Self {
        OrderEvent::DeliveryAddressChanged(DeliveryAddressChangedData {
            delivery_address: delivery_address.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use event_store::Version;

    use super::*;
    use crate::order::Money;

    fn created() -> OrderEvent {
        OrderEvent::order_created(
            AggregateId::new(),
            vec![ShopItem::new("sku-1", "Mug", "Blue mug", 2, Money::from_cents(750))],
            AccountEmail::parse("buyer@example.com").unwrap(),
            Some("1 Main St".to_string()),
        )
    }

    fn envelope_for(event: &OrderEvent, event_type: &str, schema_version: u32) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(AggregateId::new())
            .aggregate_type("Order")
            .event_type(event_type)
            .version(Version::first())
            .payload(event)
            .unwrap()
            .schema_version(schema_version)
            .build()
            .unwrap()
    }

    #[test]
    fn event_types_are_listed() {
        let events = [
            created(),
            OrderEvent::order_paid(),
            OrderEvent::order_submitted(),
            OrderEvent::order_delivering(),
            OrderEvent::order_delivered(Utc::now()),
            OrderEvent::order_canceled("changed my mind"),
            OrderEvent::order_updated(vec![]),
            OrderEvent::delivery_address_changed("2 Side St"),
        ];
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, ORDER_EVENT_TYPES.to_vec());
    }

    #[test]
    fn payload_is_tagged_with_event_type() {
        let bytes = codec::encode(&OrderEvent::order_paid()).unwrap();
        assert_eq!(
            codec::peek_event_type(&bytes).unwrap().as_deref(),
            Some("OrderPaid")
        );
    }

    #[test]
    fn from_envelope_decodes_known_events() {
        let event = created();
        let envelope = envelope_for(&event, "OrderCreated", 1);
        assert_eq!(OrderEvent::from_envelope(&envelope).unwrap(), Some(event));
    }

    #[test]
    fn from_envelope_skips_unknown_types() {
        let envelope = envelope_for(&OrderEvent::order_paid(), "OrderRefunded", 1);
        assert_eq!(OrderEvent::from_envelope(&envelope).unwrap(), None);
    }

    #[test]
    fn from_envelope_rejects_future_schema() {
        let envelope = envelope_for(&OrderEvent::order_paid(), "OrderPaid", 2);
        assert!(matches!(
            OrderEvent::from_envelope(&envelope),
            Err(CodecError::UnsupportedSchemaVersion { found: 2, .. })
        ));
    }
}
