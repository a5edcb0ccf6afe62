//! Order aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod service;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use commands::*;
pub use events::{
    DeliveryAddressChangedData, ORDER_EVENT_TYPES, OrderCanceledData, OrderCreatedData,
    OrderDeliveredData, OrderDeliveringData, OrderEvent, OrderPaidData, OrderSubmittedData,
    OrderUpdatedData,
};
pub use service::OrderService;
pub use state::OrderStatus;
pub use value_objects::{AccountEmail, Money, ShopItem};

use thiserror::Error;

/// Malformed command payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("order must contain at least one shop item")]
    NoItems,

    #[error("shop item {item_id} has quantity 0")]
    ZeroQuantity { item_id: String },

    #[error("shop item {item_id} has negative price {price_cents}")]
    NegativePrice { item_id: String, price_cents: i64 },

    #[error("shop item {item_id} has quantity {quantity}, above the supported maximum")]
    QuantityTooLarge { item_id: String, quantity: u64 },

    #[error("order total exceeds the representable amount")]
    TotalOverflow,

    #[error("invalid account email: {0:?}")]
    InvalidEmail(String),

    /// A required text field is empty or whitespace.
    #[error("{0} must not be blank")]
    Blank(&'static str),
}

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    /// The command is not allowed in the order's current status.
    #[error("Invalid transition: cannot {action} an order in {status} status")]
    InvalidTransition {
        status: OrderStatus,
        action: &'static str,
    },
}
