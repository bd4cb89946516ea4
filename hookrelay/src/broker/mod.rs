//! Broker module: the four-operation queue contract and its backends.
//!
//! ```text
//! Receiver --publish--> [durable queue] --receive--> Forwarder --complete/abandon-->
//! ```
//!
//! - [`AmqpBroker`]: RabbitMQ via lapin
//! - [`InMemoryBroker`]: process-local queue with redelivery and failure injection

pub mod amqp;
pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;

/// Broker-assigned identifier of one delivery.
///
/// `epoch` identifies the connection the message was received on and `tag`
/// the delivery within it. Settlements must go back through the same epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub epoch: u64,
    pub tag: u64,
}

impl MessageId {
    pub fn new(epoch: u64, tag: u64) -> Self {
        Self { epoch, tag }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.tag)
    }
}

/// A message handed out by [`MessageBroker::receive`].
///
/// The body is exactly what was published. The message stays locked to this
/// consumer until it is completed or abandoned.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub body: Vec<u8>,
    /// Set when the broker has handed this message out before
    pub redelivered: bool,
}

/// Durable queue used between the receiver and the forwarder.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Enqueue a body.
    async fn publish(&self, body: &[u8]) -> Result<(), BrokerError>;

    /// Take up to `max_count` messages, waiting at most `max_wait` for the first.
    ///
    /// An empty batch means the wait elapsed with nothing ready.
    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<QueuedMessage>, BrokerError>;

    /// Permanently remove a received message.
    async fn complete(&self, id: &MessageId) -> Result<(), BrokerError>;

    /// Return a received message to the queue for redelivery.
    async fn abandon(&self, id: &MessageId) -> Result<(), BrokerError>;

    /// Release transport resources.
    async fn close(&self) {}
}
