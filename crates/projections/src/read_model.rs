//! The order read model and the stores that hold it.
//!
//! Every write is guarded by the version of the event that produced it, so
//! redelivered events are recognised as duplicates and events that arrive
//! ahead of their predecessors are refused until those have been projected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{Money, OrderStatus, ShopItem};
use event_store::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ReadModelError;

/// Denormalised view of one order, as served to queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDocument {
    pub order_id: AggregateId,
    /// Version of the last event folded into this document.
    pub version: Version,
    pub status: OrderStatus,
    pub shop_items: Vec<ShopItem>,
    pub total_price: Money,
    pub account_email: String,
    pub delivery_address: Option<String>,
    pub cancel_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub delivery_started_at: Option<DateTime<Utc>>,
    pub delivery_timestamp: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A partial change to an existing document.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderPatch {
    Paid { paid_at: DateTime<Utc> },
    Submitted { submitted_at: DateTime<Utc> },
    DeliveryStarted { started_at: DateTime<Utc> },
    Delivered { delivery_timestamp: DateTime<Utc> },
    Canceled {
        cancel_reason: String,
        canceled_at: DateTime<Utc>,
    },
    ItemsReplaced { shop_items: Vec<ShopItem> },
    DeliveryAddressChanged { delivery_address: String },
}

impl OrderPatch {
    pub fn apply_to(&self, document: &mut OrderDocument) {
        match self {
            OrderPatch::Paid { paid_at } => {
                document.status = OrderStatus::Paid;
                document.paid_at = Some(*paid_at);
            }
            OrderPatch::Submitted { submitted_at } => {
                document.status = OrderStatus::Submitted;
                document.submitted_at = Some(*submitted_at);
            }
            OrderPatch::DeliveryStarted { started_at } => {
                document.status = OrderStatus::Delivering;
                document.delivery_started_at = Some(*started_at);
            }
            OrderPatch::Delivered { delivery_timestamp } => {
                document.status = OrderStatus::Delivered;
                document.delivery_timestamp = Some(*delivery_timestamp);
            }
            OrderPatch::Canceled {
                cancel_reason,
                canceled_at,
            } => {
                document.status = OrderStatus::Canceled;
                document.cancel_reason = Some(cancel_reason.clone());
                document.canceled_at = Some(*canceled_at);
            }
            OrderPatch::ItemsReplaced { shop_items } => {
                document.total_price = shop_items.iter().map(ShopItem::total_price).sum();
                document.shop_items = shop_items.clone();
            }
            OrderPatch::DeliveryAddressChanged { delivery_address } => {
                document.delivery_address = Some(delivery_address.clone());
            }
        }
    }
}

/// Result of a guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The write was already reflected in the store and was skipped.
    Duplicate,
}

/// Decides whether an update at `incoming` may be applied on top of a
/// document at `stored`.
pub(crate) fn admit_update(
    order_id: AggregateId,
    stored: Version,
    incoming: Version,
) -> Result<WriteOutcome, ReadModelError> {
    if incoming <= stored {
        Ok(WriteOutcome::Duplicate)
    } else if incoming == stored.next() {
        Ok(WriteOutcome::Applied)
    } else {
        Err(ReadModelError::VersionGap {
            order_id,
            stored,
            incoming,
        })
    }
}

/// Storage for order documents.
///
/// Implementations must make each `insert` and `update` atomic per document.
#[async_trait]
pub trait OrderReadStore: Send + Sync {
    /// Inserts a new document. An existing document with the same id is left
    /// untouched and reported as a duplicate.
    async fn insert(&self, document: OrderDocument) -> Result<WriteOutcome, ReadModelError>;

    /// Applies `patch` produced by the event at `version`.
    ///
    /// Skips versions already applied. Fails with `VersionGap` or
    /// `MissingDocument` when earlier events are still outstanding.
    async fn update(
        &self,
        order_id: AggregateId,
        version: Version,
        updated_at: DateTime<Utc>,
        patch: OrderPatch,
    ) -> Result<WriteOutcome, ReadModelError>;

    async fn get(&self, order_id: AggregateId) -> Result<Option<OrderDocument>, ReadModelError>;

    /// Removes every document.
    async fn clear(&self) -> Result<(), ReadModelError>;
}

#[async_trait]
impl<T: OrderReadStore + ?Sized> OrderReadStore for Arc<T> {
    async fn insert(&self, document: OrderDocument) -> Result<WriteOutcome, ReadModelError> {
        (**self).insert(document).await
    }

    async fn update(
        &self,
        order_id: AggregateId,
        version: Version,
        updated_at: DateTime<Utc>,
        patch: OrderPatch,
    ) -> Result<WriteOutcome, ReadModelError> {
        (**self).update(order_id, version, updated_at, patch).await
    }

    async fn get(&self, order_id: AggregateId) -> Result<Option<OrderDocument>, ReadModelError> {
        (**self).get(order_id).await
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        (**self).clear().await
    }
}

/// In-memory document store.
#[derive(Clone, Default)]
pub struct InMemoryOrderReadStore {
    documents: Arc<RwLock<HashMap<AggregateId, OrderDocument>>>,
}

impl InMemoryOrderReadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[async_trait]
impl OrderReadStore for InMemoryOrderReadStore {
    async fn insert(&self, document: OrderDocument) -> Result<WriteOutcome, ReadModelError> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&document.order_id) {
            return Ok(WriteOutcome::Duplicate);
        }
        documents.insert(document.order_id, document);
        Ok(WriteOutcome::Applied)
    }

    async fn update(
        &self,
        order_id: AggregateId,
        version: Version,
        updated_at: DateTime<Utc>,
        patch: OrderPatch,
    ) -> Result<WriteOutcome, ReadModelError> {
        let mut documents = self.documents.write().await;
        let Some(document) = documents.get_mut(&order_id) else {
            return Err(ReadModelError::MissingDocument {
                order_id,
                incoming: version,
            });
        };

        let outcome = admit_update(order_id, document.version, version)?;
        if outcome == WriteOutcome::Applied {
            patch.apply_to(document);
            document.version = version;
            document.updated_at = updated_at;
        }
        Ok(outcome)
    }

    async fn get(&self, order_id: AggregateId) -> Result<Option<OrderDocument>, ReadModelError> {
        Ok(self.documents.read().await.get(&order_id).cloned())
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        self.documents.write().await.clear();
        Ok(())
    }
}
