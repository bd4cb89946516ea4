//! hookrelay Receiver - signed webhook ingress.
//!
//! This binary provides a thin web server that:
//! - Receives GitHub-style webhooks on `/webhook`
//! - Verifies the HMAC-SHA256 body signature
//! - Returns 200 immediately and enqueues the raw body in the background
//!
//! Forwarding to the target tool happens in the forwarder.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookrelay::shutdown::shutdown_signal;
use hookrelay::{router, AmqpBroker, AppState, Config, MessageBroker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("receiver_starting");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let secret = config
        .receiver_secret()
        .context("Invalid receiver configuration")?;

    info!(
        port = config.port,
        queue = %config.queue_name,
        max_body_bytes = config.max_body_bytes,
        "config_loaded"
    );

    // Connect up front so a bad broker URL fails startup
    let broker = AmqpBroker::connect(
        config.amqp_url.clone(),
        config.queue_name.clone(),
        config.publish_timeout,
    )
    .await
    .context("Failed to connect to RabbitMQ")?;
    let broker = Arc::new(broker);

    info!("amqp_publisher_ready");

    let state = AppState::new(secret, broker.clone());
    let publishes = state.publishes.clone();
    let app = router(state, config.max_body_bytes);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "receiver_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("receiver_shutting_down");
        })
        .await
        .context("Server error")?;

    // Let accepted events reach the broker before the connection goes away
    publishes.close();
    let pending = publishes.len();
    if timeout(config.shutdown_drain, publishes.wait()).await.is_err() {
        warn!(
            pending = publishes.len(),
            drain_ms = config.shutdown_drain.as_millis() as u64,
            "receiver_publish_drain_timeout"
        );
    } else {
        info!(drained = pending, "receiver_publishes_drained");
    }

    broker.close().await;

    info!("receiver_shutdown_complete");

    Ok(())
}
