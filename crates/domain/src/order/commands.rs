//! Order commands.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use crate::command::Command;

use super::{Order, ShopItem};

/// Command to create a new order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: AggregateId,

    pub shop_items: Vec<ShopItem>,

    /// Raw address, validated by the aggregate.
    pub account_email: String,

    #[serde(default)]
    pub delivery_address: Option<String>,
}

impl CreateOrder {
    pub fn new(
        order_id: AggregateId,
        shop_items: Vec<ShopItem>,
        account_email: impl Into<String>,
    ) -> Self {
        Self {
            order_id,
            shop_items,
            account_email: account_email.into(),
            delivery_address: None,
        }
    }

    pub fn with_delivery_address(mut self, delivery_address: impl Into<String>) -> Self {
        self.delivery_address = Some(delivery_address.into());
        self
    }
}

/// Command to mark an order as paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayOrder {
    pub order_id: AggregateId,
}

impl PayOrder {
    pub fn new(order_id: AggregateId) -> Self {
        Self { order_id }
    }
}

/// Command to submit a paid order for fulfilment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOrder {
    pub order_id: AggregateId,
}

impl SubmitOrder {
    pub fn new(order_id: AggregateId) -> Self {
        Self { order_id }
    }
}

/// Command to replace the shop items of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOrder {
    pub order_id: AggregateId,
    pub shop_items: Vec<ShopItem>,
}

impl UpdateOrder {
    pub fn new(order_id: AggregateId, shop_items: Vec<ShopItem>) -> Self {
        Self {
            order_id,
            shop_items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDeliveryAddress {
    pub order_id: AggregateId,
    pub delivery_address: String,
}

impl ChangeDeliveryAddress {
    pub fn new(order_id: AggregateId, delivery_address: impl Into<String>) -> Self {
        Self {
            order_id,
            delivery_address: delivery_address.into(),
        }
    }
}

/// Command to hand a submitted order to delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDelivery {
    pub order_id: AggregateId,
}

impl StartDelivery {
    pub fn new(order_id: AggregateId) -> Self {
        Self { order_id }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteDelivery {
    pub order_id: AggregateId,

    /// When the order was delivered. Defaults to the time the command runs.
    #[serde(default)]
    pub delivery_timestamp: Option<DateTime<Utc>>,
}

impl CompleteDelivery {
    pub fn new(order_id: AggregateId) -> Self {
        Self {
            order_id,
            delivery_timestamp: None,
        }
    }

    pub fn at(order_id: AggregateId, delivery_timestamp: DateTime<Utc>) -> Self {
        Self {
            order_id,
            delivery_timestamp: Some(delivery_timestamp),
        }
    }
}

/// Command to cancel an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: AggregateId,
    pub cancel_reason: String,
}

impl CancelOrder {
    pub fn new(order_id: AggregateId, cancel_reason: impl Into<String>) -> Self {
        Self {
            order_id,
            cancel_reason: cancel_reason.into(),
        }
    }
}

impl Command for CreateOrder {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }

    fn creates(&self) -> bool {
        true
    }
}

macro_rules! order_command {
    ($($command:ty),+ $(,)?) => {
        $(
            impl Command for $command {
                type Aggregate = Order;

                fn aggregate_id(&self) -> AggregateId {
                    self.order_id
                }
            }
        )+
    };
}

order_command!(
    PayOrder,
    SubmitOrder,
    UpdateOrder,
    ChangeDeliveryAddress,
    StartDelivery,
    CompleteDelivery,
    CancelOrder,
);
