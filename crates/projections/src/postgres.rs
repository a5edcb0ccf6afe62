use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::Version;
use sqlx::{PgPool, Row};

use crate::error::ReadModelError;
use crate::read_model::{OrderDocument, OrderPatch, OrderReadStore, WriteOutcome, admit_update};

/// PostgreSQL-backed order documents, one JSONB row per order.
///
/// The table is created by the shared migrations run through
/// `PostgresEventStore::run_migrations`.
#[derive(Clone)]
pub struct PostgresOrderReadStore {
    pool: PgPool,
}

impl PostgresOrderReadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OrderReadStore for PostgresOrderReadStore {
    async fn insert(&self, document: OrderDocument) -> Result<WriteOutcome, ReadModelError> {
        let result = sqlx::query(
            r#"
            INSERT INTO order_documents (order_id, version, document, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(document.order_id.as_uuid())
        .bind(document.version.as_i64())
        .bind(serde_json::to_value(&document)?)
        .bind(document.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(WriteOutcome::Duplicate)
        } else {
            Ok(WriteOutcome::Applied)
        }
    }

    async fn update(
        &self,
        order_id: AggregateId,
        version: Version,
        updated_at: DateTime<Utc>,
        patch: OrderPatch,
    ) -> Result<WriteOutcome, ReadModelError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT version, document FROM order_documents WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(ReadModelError::MissingDocument {
                order_id,
                incoming: version,
            });
        };

        let stored = Version::new(row.try_get("version")?);
        let outcome = admit_update(order_id, stored, version)?;
        if outcome == WriteOutcome::Duplicate {
            return Ok(outcome);
        }

        let mut document: OrderDocument = serde_json::from_value(row.try_get("document")?)?;
        patch.apply_to(&mut document);
        document.version = version;
        document.updated_at = updated_at;

        sqlx::query(
            "UPDATE order_documents SET version = $2, document = $3, updated_at = $4 \
             WHERE order_id = $1",
        )
        .bind(order_id.as_uuid())
        .bind(version.as_i64())
        .bind(serde_json::to_value(&document)?)
        .bind(updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get(&self, order_id: AggregateId) -> Result<Option<OrderDocument>, ReadModelError> {
        let row = sqlx::query("SELECT document FROM order_documents WHERE order_id = $1")
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_value(row.try_get("document")?)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        sqlx::query("DELETE FROM order_documents")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
