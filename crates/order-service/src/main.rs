//! Order service entry point.

use std::sync::Arc;

use event_store::{EventStore, InMemoryEventStore, PersistentSubscriptions, PostgresEventStore};
use order_service::config::{Config, LogFormat};
use order_service::routes::orders::AppState;
use order_service::supervisor;
use projections::{
    InMemoryOrderReadStore, OrderProjection, OrderReadStore, PostgresOrderReadStore,
    ProjectionEngine,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Serves HTTP and runs the projection supervisor until a shutdown signal,
/// then stops the supervisor and waits for in-flight projection work.
async fn serve<S>(
    config: Config,
    events: S,
    read_model: Arc<dyn OrderReadStore>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) where
    S: EventStore + PersistentSubscriptions + Clone + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = ProjectionEngine::new(
        events.clone(),
        Arc::new(OrderProjection::new(read_model.clone())),
        config.projection.clone(),
    );
    let projection = tokio::spawn(supervisor::supervise(
        engine,
        shutdown_rx,
        supervisor::restart_policy(),
    ));

    let state = Arc::new(AppState::new(Arc::new(events), read_model));
    let app = order_service::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, group = %config.projection.consumer_group, "starting order service");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = projection.await {
        tracing::error!(error = %e, "projection supervisor panicked");
    }

    tracing::info!("order service shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let events = PostgresEventStore::new(pool.clone());
            events
                .run_migrations()
                .await
                .expect("failed to run migrations");
            let read_model = Arc::new(PostgresOrderReadStore::new(pool));
            tracing::info!("using PostgreSQL stores");
            serve(config, events, read_model, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            serve(
                config,
                InMemoryEventStore::new(),
                Arc::new(InMemoryOrderReadStore::new()),
                metrics_handle,
            )
            .await;
        }
    }
}
