//! Read model views for the CQRS query side.

pub mod orders;

pub use orders::OrderProjection;
