//! hookrelay Forwarder - drains the relay queue into the on-premise tool.
//!
//! Receives one batch at a time, forwards each body to the target tool, and
//! completes it on success or abandons it for redelivery on failure. Stops
//! receiving on SIGINT/SIGTERM and exits once the in-flight message is settled.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookrelay::shutdown::cancel_on_signal;
use hookrelay::{AmqpBroker, Config, ForwardLoop, HttpForwarder, LoopSettings, MessageBroker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("forwarder_starting");

    // Load configuration from environment
    let config = Config::from_env().context("Failed to load configuration")?;
    let target = config.target_url().context("Invalid forwarder configuration")?;
    let settings = LoopSettings::from(&config);

    info!(
        queue = %config.queue_name,
        target_url = %target,
        auth_token_set = config.target_tool_auth_token.is_some(),
        batch_size = settings.batch_size,
        receive_wait_ms = settings.receive_wait.as_millis() as u64,
        forward_timeout_ms = settings.forward_timeout.as_millis() as u64,
        "config_loaded"
    );

    let sink = HttpForwarder::new(
        target,
        config.target_tool_auth_token.clone(),
        config.forward_timeout,
    )
    .context("Failed to create HTTP client")?;

    let broker = AmqpBroker::connect(
        config.amqp_url.clone(),
        config.queue_name.clone(),
        config.publish_timeout,
    )
    .await
    .context("Failed to connect to RabbitMQ")?;
    let broker = Arc::new(broker);

    info!("forwarder_ready");

    let shutdown = cancel_on_signal();
    let relay = ForwardLoop::new(broker.clone(), Arc::new(sink), settings);
    let stats = relay.run(shutdown).await;

    broker.close().await;

    info!(
        completed = stats.completed,
        abandoned = stats.abandoned,
        "forwarder_shutdown_complete"
    );

    Ok(())
}
