//! Identifiers shared by the write side and the read side.

pub mod types;

pub use types::{AggregateId, StreamId};
