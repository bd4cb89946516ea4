//! hookrelay - signed webhook relay.
//!
//! This library provides shared modules for the two hookrelay binaries:
//! - `hookrelay-receiver`: verifies webhook signatures and enqueues raw bodies
//! - `hookrelay-forwarder`: drains the queue into the on-premise tool
//!
//! ## Architecture
//!
//! ```text
//! Webhooks → Receiver → [durable queue] → Forwarder → Target tool
//!                                            └── abandon → redelivery
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod forward;
pub mod relay;
pub mod shutdown;
pub mod web;

// Re-export commonly used types
pub use broker::{AmqpBroker, InMemoryBroker, MessageBroker, MessageId, QueuedMessage};
pub use config::Config;
pub use error::{BrokerError, ConfigError, ForwardError};
pub use forward::{ForwardSink, HttpForwarder};
pub use relay::{ForwardLoop, LoopSettings, LoopStats, Resolution};
pub use web::{router, validate_signature, AppState};
