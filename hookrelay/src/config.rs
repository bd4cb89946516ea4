//! Configuration module for environment variable parsing.
//!
//! Both binaries read the same [`Config`]; each one then checks the fields it
//! actually needs (`receiver_secret`, `target_url`) so a missing value fails
//! startup instead of surfacing later at request time.

use std::env;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::ConfigError;

/// Default maximum webhook body accepted by the receiver (25 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Shortest receive wait; keeps an empty queue from being polled back to back.
pub const MIN_RECEIVE_WAIT: Duration = Duration::from_millis(100);

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// RabbitMQ connection URL
    pub amqp_url: String,

    /// Durable queue shared by the receiver and the forwarder
    pub queue_name: String,

    // =========================================================================
    // Receiver
    // =========================================================================

    /// Port for the receiver to listen on
    pub port: u16,

    /// Shared secret used to sign webhook bodies, as set
    pub webhook_secret: Option<String>,

    /// Upper bound on a single broker publish
    pub publish_timeout: Duration,

    /// Largest request body the receiver will read
    pub max_body_bytes: usize,

    /// How long shutdown waits for detached publishes to finish
    pub shutdown_drain: Duration,

    // =========================================================================
    // Forwarder
    // =========================================================================

    /// Target tool endpoint, if configured
    pub target_tool_url: Option<String>,

    /// Optional bearer token for the target tool
    pub target_tool_auth_token: Option<String>,

    /// Messages requested per receive
    pub receive_batch_size: usize,

    /// Maximum wait for a receive to return messages
    pub receive_wait: Duration,

    /// Fixed pause after a failed receive
    pub receive_error_backoff: Duration,

    /// Upper bound on one forward attempt
    pub forward_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            amqp_url: required(&lookup, "AMQP_URL")?,
            queue_name: required(&lookup, "QUEUE_NAME")?,

            port: parse_or(&lookup, "PORT", 8080),
            webhook_secret: lookup("GITHUB_WEBHOOK_SECRET"),
            publish_timeout: parse_millis(&lookup, "PUBLISH_TIMEOUT_MS", 5_000),
            max_body_bytes: parse_or(&lookup, "MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
            shutdown_drain: parse_millis(&lookup, "SHUTDOWN_DRAIN_MS", 10_000),

            target_tool_url: non_empty(lookup("TARGET_TOOL_URL")),
            target_tool_auth_token: non_empty(lookup("TARGET_TOOL_AUTH_TOKEN")),
            receive_batch_size: parse_or(&lookup, "RECEIVE_BATCH_SIZE", 1usize).max(1),
            receive_wait: parse_millis(&lookup, "RECEIVE_WAIT_MS", 10_000).max(MIN_RECEIVE_WAIT),
            receive_error_backoff: parse_millis(&lookup, "RECEIVE_ERROR_BACKOFF_MS", 2_000),
            forward_timeout: parse_millis(&lookup, "FORWARD_TIMEOUT_MS", 30_000),
        })
    }

    /// The signing secret, required by the receiver.
    pub fn receiver_secret(&self) -> Result<&str, ConfigError> {
        match self.webhook_secret.as_deref() {
            None => Err(ConfigError::Missing("GITHUB_WEBHOOK_SECRET")),
            Some("") => Err(ConfigError::Invalid {
                name: "GITHUB_WEBHOOK_SECRET",
                reason: "empty".to_string(),
            }),
            Some(secret) => Ok(secret),
        }
    }

    /// The parsed target tool URL, required by the forwarder.
    pub fn target_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .target_tool_url
            .as_deref()
            .ok_or(ConfigError::Missing("TARGET_TOOL_URL"))?;

        let url = Url::parse(raw).map_err(|e| ConfigError::Invalid {
            name: "TARGET_TOOL_URL",
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::Invalid {
                name: "TARGET_TOOL_URL",
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup(name)).ok_or(ConfigError::Missing(name))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an optional value, warning and falling back on garbage.
fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = match lookup(name) {
        Some(v) => v,
        None => return default,
    };

    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

fn parse_millis<F>(lookup: &F, name: &str, default_ms: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_millis(parse_or(lookup, name, default_ms))
}
