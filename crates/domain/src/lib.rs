//! Domain layer for the order service.
//!
//! This crate provides the core domain abstractions including:
//! - Aggregate trait for event-sourced entities
//! - DomainEvent trait for domain events
//! - Command trait and CommandHandler with bounded conflict retry
//! - Order aggregate with its lifecycle state machine

pub mod aggregate;
pub mod command;
pub mod error;
pub mod order;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{Command, CommandHandler, CommandResult, RetryPolicy};
pub use error::DomainError;
pub use order::{
    AccountEmail, CancelOrder, ChangeDeliveryAddress, CompleteDelivery, CreateOrder, Money, Order,
    OrderError, OrderEvent, OrderService, OrderStatus, PayOrder, ShopItem, StartDelivery,
    SubmitOrder, UpdateOrder, ValidationError,
};
