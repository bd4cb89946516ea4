//! Error types shared by the relay components.
//!
//! Broker and forward errors are never surfaced to the webhook caller; they
//! only travel as far as the log line that records them.

use std::time::Duration;

use thiserror::Error;

use crate::broker::MessageId;

/// Configuration could not be loaded from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is required and not set")]
    Missing(&'static str),

    #[error("environment variable {name} has an invalid value: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// A broker operation failed.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("broker {operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The message was received on a channel that has since been replaced.
    /// The broker has already returned it to the queue.
    #[error("message {0} belongs to a closed channel")]
    StaleDelivery(MessageId),

    /// The publish reached the broker but was not accepted into the queue.
    #[error("broker rejected publish: {0}")]
    Rejected(&'static str),

    #[error("message {0} is not locked by this consumer")]
    UnknownMessage(MessageId),

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// A single forward attempt to the target tool failed.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request to target tool failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("target tool returned status {status}")]
    Status { status: u16, body: String },

    #[error("forward timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl ForwardError {
    /// True when the target tool never produced a response.
    pub fn is_transport(&self) -> bool {
        matches!(self, ForwardError::Request(_) | ForwardError::Timeout(_))
    }
}
