//! Query handlers over the order read model.

use common::AggregateId;

use crate::error::QueryError;
use crate::read_model::{OrderDocument, OrderReadStore};

/// Read-side entry point. Documents may lag behind the write side.
pub struct OrderQueries<R: OrderReadStore> {
    store: R,
}

impl<R: OrderReadStore> OrderQueries<R> {
    pub fn new(store: R) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_id(&self, order_id: AggregateId) -> Result<OrderDocument, QueryError> {
        self.store
            .get(order_id)
            .await?
            .ok_or(QueryError::NotFound(order_id))
    }
}
