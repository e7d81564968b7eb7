//! Gateway service entry point.
//!
//! Streams validated clinical and dispatch events to WebSocket clients.

use anyhow::{Context, Result};
use gateway::{
    create_router, run_heartbeat, AppState, EventConsumer, EventRouter, EventType, GatewayConfig,
    SchemaGate, SessionRegistry,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting realtime gateway");

    let config = GatewayConfig::from_env()?;
    config.log_summary();

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Contracts must load completely before anything is consumed
    let gate = Arc::new(SchemaGate::load(&config.contracts_path)?);
    info!(
        "Loaded {} event schemas from {} documents",
        gate.schema_count(),
        gate.document_count()
    );

    let registry = Arc::new(SessionRegistry::new(config.queue_limits()));

    let consumer = Arc::new(EventConsumer::new(config.consumer_config()));
    consumer.connect().await?;
    consumer.ensure_topology().await?;

    let router = Arc::new(EventRouter::new(gate.clone(), registry.clone()));
    consumer.subscribe(&EventType::ALL, router).await?;
    info!("Consuming {} event types", EventType::ALL.len());

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_handle = tokio::spawn(run_heartbeat(
        registry.clone(),
        config.heartbeat_interval,
        heartbeat_cancel.clone(),
    ));

    let state = Arc::new(AppState {
        registry,
        consumer: consumer.clone(),
        gate,
    });
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.service_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {} (WebSocket at /ws)", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping heartbeat...");
    heartbeat_cancel.cancel();
    let _ = heartbeat_handle.await;

    consumer.shutdown().await;

    info!("Gateway stopped");
    Ok(())
}

/// `RUST_LOG` wins, then `LOG_LEVEL`, then `info`. `LOG_FORMAT=json` switches
/// to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info"));

    let json = env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
