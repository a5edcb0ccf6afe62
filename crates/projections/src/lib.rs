//! Read models and projections for the CQRS query side.
//!
//! - [`Projection`] trait for folding events into a read model
//! - [`ProjectionEngine`] draining a persistent subscription with a worker pool
//! - [`OrderProjection`] maintaining [`OrderDocument`]s in an [`OrderReadStore`]
//! - [`OrderQueries`] serving documents to readers

pub mod engine;
pub mod error;
pub mod postgres;
pub mod projection;
pub mod queries;
pub mod read_model;
pub mod views;

pub use engine::{EngineConfig, ProjectionEngine, rebuild};
pub use error::{ProjectionError, QueryError, ReadModelError, Result};
pub use postgres::PostgresOrderReadStore;
pub use projection::Projection;
pub use queries::OrderQueries;
pub use read_model::{InMemoryOrderReadStore, OrderDocument, OrderPatch, OrderReadStore, WriteOutcome};
pub use views::OrderProjection;
