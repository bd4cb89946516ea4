//! RabbitMQ backend for [`MessageBroker`].
//!
//! One connection and channel are shared by every caller and re-established
//! lazily when the channel drops. Receives poll with `basic_get` until the
//! wait elapses, which keeps the pull model the relay loop needs (no
//! prefetched deliveries sitting in a consumer buffer).
//!
//! The channel runs in confirm mode, so a publish only succeeds once the
//! broker has taken responsibility for the message. Every operation is
//! bounded in time, including connection setup against a peer that accepts
//! the socket and then never speaks AMQP.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{MessageBroker, MessageId, QueuedMessage};
use crate::error::BrokerError;

/// Pause between empty `basic_get` polls.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Slack past `max_wait` for a poll or reconnect already in flight.
const RECEIVE_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on connecting at startup.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single ack or nack.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// RabbitMQ broker with connection management.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    queue: String,
    publish_timeout: Duration,
    epoch: AtomicU64,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<(u64, Channel)>>,
}

impl AmqpBroker {
    /// Create a broker handle without connecting.
    pub fn new(url: String, queue: String, publish_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url,
                queue,
                publish_timeout,
                epoch: AtomicU64::new(0),
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Create a broker handle and connect immediately.
    ///
    /// Used at startup so an unreachable broker fails the process.
    pub async fn connect(
        url: String,
        queue: String,
        publish_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let broker = Self::new(url, queue, publish_timeout);
        bounded("connect", CONNECT_TIMEOUT, broker.ensure_connected()).await?;
        Ok(broker)
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<(u64, Channel), BrokerError> {
        {
            let channel = self.inner.channel.read().await;
            if let Some((epoch, ch)) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok((*epoch, ch.clone()));
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some((epoch, ch)) = channel.as_ref() {
            if ch.status().connected() {
                return Ok((*epoch, ch.clone()));
            }
        }

        info!(queue = %self.inner.queue, "amqp_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default()).await?;
        let ch = conn.create_channel().await?;

        // Publishes wait for the broker's ack instead of resolving on write
        ch.confirm_select(ConfirmSelectOptions::default()).await?;

        // Idempotent; both binaries declare the same durable queue
        ch.queue_declare(
            &self.inner.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        info!(queue = %self.inner.queue, epoch = epoch, "amqp_connected");

        *connection = Some(conn);
        *channel = Some((epoch, ch.clone()));

        Ok((epoch, ch))
    }

    /// Channel for settling `id`, provided it is still the live one.
    async fn channel_for(&self, id: &MessageId) -> Result<Channel, BrokerError> {
        let channel = self.inner.channel.read().await;
        match channel.as_ref() {
            Some((epoch, ch)) if *epoch == id.epoch && ch.status().connected() => Ok(ch.clone()),
            _ => Err(BrokerError::StaleDelivery(*id)),
        }
    }

    /// Drop the current connection so the next call reconnects.
    ///
    /// Closing it makes the broker requeue anything delivered on the old
    /// channel, including a `basic_get` reply nobody is waiting for anymore.
    async fn reset(&self) {
        let conn = {
            let mut connection = self.inner.connection.write().await;
            let mut channel = self.inner.channel.write().await;
            channel.take();
            connection.take()
        };

        if let Some(conn) = conn {
            warn!(queue = %self.inner.queue, "amqp_connection_reset");
            tokio::spawn(async move {
                if let Ok(Err(e)) = timeout(SETTLE_TIMEOUT, conn.close(320, "Reset")).await {
                    debug!(error = %e, "amqp_reset_close_error");
                }
            });
        }
    }

    /// Poll until `batch` holds something or `deadline` passes.
    async fn fill(
        &self,
        batch: &mut Vec<QueuedMessage>,
        max_count: usize,
        deadline: Instant,
    ) -> Result<(), BrokerError> {
        loop {
            let (epoch, channel) = self.ensure_connected().await?;

            while batch.len() < max_count {
                let got = channel
                    .basic_get(&self.inner.queue, BasicGetOptions::default())
                    .await?;

                match got {
                    Some(message) => {
                        let delivery = message.delivery;
                        batch.push(QueuedMessage {
                            id: MessageId::new(epoch, delivery.delivery_tag),
                            body: delivery.data,
                            redelivered: delivery.redelivered,
                        });
                    }
                    None => break,
                }
            }

            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(());
            }

            sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }
}

/// Run `operation`, giving up after `after`.
async fn bounded<T, F>(
    operation: &'static str,
    after: Duration,
    operation_future: F,
) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    timeout(after, operation_future)
        .await
        .map_err(|_| BrokerError::Timeout { operation, after })?
}

/// Map a publisher confirm to the publish outcome.
///
/// With `mandatory` set, an unroutable message comes back as an ack that
/// carries the returned message, which is a failure here.
fn confirmation_outcome(confirmation: Confirmation) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(_)) => Err(BrokerError::Rejected("returned as unroutable")),
        Confirmation::Nack(_) => Err(BrokerError::Rejected("nacked by broker")),
        Confirmation::NotRequested => Err(BrokerError::Rejected("channel not in confirm mode")),
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn publish(&self, body: &[u8]) -> Result<(), BrokerError> {
        let publish = async {
            let (_, channel) = self.ensure_connected().await?;

            let confirmation = channel
                .basic_publish(
                    "",
                    &self.inner.queue,
                    BasicPublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                    body,
                    BasicProperties::default()
                        .with_delivery_mode(2) // Persistent
                        .with_content_type("application/json".into()),
                )
                .await?
                .await?;

            confirmation_outcome(confirmation)
        };

        bounded("publish", self.inner.publish_timeout, publish).await?;

        debug!(
            queue = %self.inner.queue,
            body_length = body.len(),
            "amqp_published"
        );

        Ok(())
    }

    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<QueuedMessage>, BrokerError> {
        let deadline = Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max_count);

        let outcome = timeout_at(
            deadline + RECEIVE_GRACE,
            self.fill(&mut batch, max_count, deadline),
        )
        .await;

        match outcome {
            Ok(Ok(())) => Ok(batch),
            // Messages already pulled are locked to us; hand them out
            Ok(Err(_)) | Err(_) if !batch.is_empty() => Ok(batch),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.reset().await;
                Err(BrokerError::Timeout {
                    operation: "receive",
                    after: max_wait + RECEIVE_GRACE,
                })
            }
        }
    }

    async fn complete(&self, id: &MessageId) -> Result<(), BrokerError> {
        let channel = self.channel_for(id).await?;
        bounded("complete", SETTLE_TIMEOUT, async {
            channel
                .basic_ack(id.tag, BasicAckOptions::default())
                .await?;
            Ok(())
        })
        .await
    }

    async fn abandon(&self, id: &MessageId) -> Result<(), BrokerError> {
        let channel = self.channel_for(id).await?;
        bounded("abandon", SETTLE_TIMEOUT, async {
            channel
                .basic_nack(
                    id.tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// Close the connection gracefully.
    async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some((_, ch)) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "amqp_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "amqp_connection_close_error");
            }
        }

        info!(queue = %self.inner.queue, "amqp_closed");
    }
}
