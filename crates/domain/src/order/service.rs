//! Order service: the command side entry point for order operations.

use common::AggregateId;
use event_store::{EventEnvelope, EventStore, EventStoreExt};

use crate::aggregate::Aggregate;
use crate::command::{CommandHandler, CommandResult, RetryPolicy};
use crate::error::DomainError;

use super::{
    CancelOrder, ChangeDeliveryAddress, CompleteDelivery, CreateOrder, Order, PayOrder,
    StartDelivery, SubmitOrder, UpdateOrder,
};

/// Service for managing orders.
///
/// Wraps a [`CommandHandler`] so every operation loads the order, runs the
/// matching aggregate command and appends the result, retrying on
/// concurrency conflicts.
pub struct OrderService<S: EventStore> {
    handler: CommandHandler<S, Order>,
}

impl<S: EventStore> OrderService<S> {
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
        }
    }

    pub fn with_retry_policy(store: S, retry: RetryPolicy) -> Self {
        Self {
            handler: CommandHandler::with_retry_policy(store, retry),
        }
    }

    pub fn handler(&self) -> &CommandHandler<S, Order> {
        &self.handler
    }

    #[tracing::instrument(skip(self), fields(order_id = %cmd.order_id))]
    pub async fn create_order(
        &self,
        cmd: CreateOrder,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .dispatch(&cmd, |order| {
                order.create(
                    cmd.order_id,
                    cmd.shop_items.clone(),
                    &cmd.account_email,
                    cmd.delivery_address.clone(),
                )
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn pay_order(&self, cmd: PayOrder) -> Result<CommandResult<Order>, DomainError> {
        self.handler.dispatch(&cmd, Order::pay).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn submit_order(
        &self,
        cmd: SubmitOrder,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler.dispatch(&cmd, Order::submit).await
    }

    /// Replaces the shop items of an order.
    #[tracing::instrument(skip(self), fields(order_id = %cmd.order_id))]
    pub async fn update_order(
        &self,
        cmd: UpdateOrder,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .dispatch(&cmd, |order| order.update_items(cmd.shop_items.clone()))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn change_delivery_address(
        &self,
        cmd: ChangeDeliveryAddress,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .dispatch(&cmd, |order| {
                order.change_delivery_address(cmd.delivery_address.clone())
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn start_delivery(
        &self,
        cmd: StartDelivery,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler.dispatch(&cmd, Order::start_delivery).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn complete_delivery(
        &self,
        cmd: CompleteDelivery,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .dispatch(&cmd, |order| order.complete_delivery(cmd.delivery_timestamp))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        cmd: CancelOrder,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .dispatch(&cmd, |order| order.cancel(cmd.cancel_reason.clone()))
            .await
    }

    /// Loads the write-side state of an order.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Order, DomainError> {
        self.handler.load_existing(order_id).await
    }

    /// Raw event history of an order, oldest first.
    #[tracing::instrument(skip(self))]
    pub async fn history(&self, order_id: AggregateId) -> Result<Vec<EventEnvelope>, DomainError> {
        let events = self
            .handler
            .store()
            .load_to_vec(&Order::stream_id(order_id))
            .await?;

        if events.is_empty() {
            return Err(DomainError::NotFound {
                aggregate_type: Order::aggregate_type(),
                aggregate_id: order_id,
            });
        }
        Ok(events)
    }
}
