//! HTTP front end for the order service.
//!
//! Commands go through [`domain::OrderService`] against the event store;
//! order reads come from the projected read model kept current by the
//! [`supervisor`].

pub mod config;
pub mod error;
pub mod routes;
pub mod supervisor;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::orders::{self, AppState};

/// Builds the router with every order route, health and metrics.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(orders::create))
        .route("/orders/{id}", get(orders::get))
        .route("/orders/{id}/events", get(orders::events))
        .route("/orders/{id}/pay", post(orders::pay))
        .route("/orders/{id}/submit", post(orders::submit))
        .route("/orders/{id}/deliver", post(orders::start_delivery))
        .route("/orders/{id}/complete", post(orders::complete_delivery))
        .route("/orders/{id}/cancel", post(orders::cancel))
        .route("/orders/{id}/items", put(orders::update_items))
        .route(
            "/orders/{id}/delivery-address",
            put(orders::change_delivery_address),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
