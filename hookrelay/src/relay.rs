//! The consume-forward-acknowledge loop.
//!
//! Each received message moves `received -> forwarding -> completed | abandoned`
//! and is settled exactly once. There is no retry state here: a failed
//! forward is abandoned and the broker decides when to hand it out again.
//!
//! The loop is strictly sequential. It never starts a receive while a forward
//! is outstanding, so the target tool's pace is the relay's pace.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{MessageBroker, QueuedMessage};
use crate::config::Config;
use crate::error::ForwardError;
use crate::forward::ForwardSink;

/// Tuning for [`ForwardLoop`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Messages requested per receive
    pub batch_size: usize,
    /// Maximum wait inside one receive
    pub receive_wait: Duration,
    /// Fixed pause after a failed receive
    pub receive_error_backoff: Duration,
    /// Upper bound on one forward
    pub forward_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            receive_wait: Duration::from_secs(10),
            receive_error_backoff: Duration::from_secs(2),
            forward_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.receive_batch_size.max(1),
            receive_wait: config.receive_wait,
            receive_error_backoff: config.receive_error_backoff,
            forward_timeout: config.forward_timeout,
        }
    }
}

/// How a message left the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Forwarded and removed from the broker
    Completed,
    /// Returned to the broker for redelivery
    Abandoned,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub receive_errors: u64,
    /// Complete or abandon calls the broker rejected
    pub settle_errors: u64,
}

/// Drains a broker into a forward sink until cancelled.
pub struct ForwardLoop {
    broker: Arc<dyn MessageBroker>,
    sink: Arc<dyn ForwardSink>,
    settings: LoopSettings,
}

impl ForwardLoop {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        sink: Arc<dyn ForwardSink>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            broker,
            sink,
            settings,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation is checked before each receive and between messages of a
    /// batch. A forward already in progress runs to completion and is settled
    /// before this returns, so shutdown takes at most about
    /// `max(receive_wait, forward_timeout)`.
    pub async fn run(&self, shutdown: CancellationToken) -> LoopStats {
        let mut stats = LoopStats::default();

        info!(
            batch_size = self.settings.batch_size,
            receive_wait_ms = self.settings.receive_wait.as_millis() as u64,
            forward_timeout_ms = self.settings.forward_timeout.as_millis() as u64,
            "relay_loop_started"
        );

        while !shutdown.is_cancelled() {
            let batch = match self
                .broker
                .receive(self.settings.batch_size, self.settings.receive_wait)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    stats.receive_errors += 1;
                    error!(
                        error = %e,
                        backoff_ms = self.settings.receive_error_backoff.as_millis() as u64,
                        "relay_receive_failed"
                    );

                    tokio::select! {
                        _ = sleep(self.settings.receive_error_backoff) => continue,
                        _ = shutdown.cancelled() => break,
                    }
                }
            };

            stats.received += batch.len() as u64;

            let mut pending = batch.into_iter();
            for message in pending.by_ref() {
                let resolution = self.handle(&message, &mut stats).await;
                self.record(resolution, &mut stats);

                if shutdown.is_cancelled() {
                    break;
                }
            }

            // Whatever was not forwarded goes straight back to the broker
            for message in pending {
                warn!(message_id = %message.id, "relay_message_released_on_shutdown");
                let resolution = self.abandon(&message, &mut stats).await;
                self.record(resolution, &mut stats);
            }
        }

        info!(
            received = stats.received,
            completed = stats.completed,
            abandoned = stats.abandoned,
            receive_errors = stats.receive_errors,
            settle_errors = stats.settle_errors,
            "relay_loop_stopped"
        );

        stats
    }

    /// Forward one message and settle it.
    pub async fn handle(&self, message: &QueuedMessage, stats: &mut LoopStats) -> Resolution {
        info!(
            message_id = %message.id,
            body_length = message.body.len(),
            redelivered = message.redelivered,
            "relay_message_received"
        );

        match self.forward(&message.body).await {
            Ok(()) => {
                info!(message_id = %message.id, "relay_forward_succeeded");
                self.complete(message, stats).await
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    error = %e,
                    transport_failure = e.is_transport(),
                    "relay_forward_failed"
                );
                self.abandon(message, stats).await
            }
        }
    }

    async fn forward(&self, body: &[u8]) -> Result<(), ForwardError> {
        match timeout(self.settings.forward_timeout, self.sink.forward(body)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ForwardError::Timeout(self.settings.forward_timeout)),
        }
    }

    async fn complete(&self, message: &QueuedMessage, stats: &mut LoopStats) -> Resolution {
        match self.broker.complete(&message.id).await {
            Ok(()) => info!(message_id = %message.id, "relay_message_completed"),
            Err(e) => {
                // Forwarded but still on the broker: the tool will see it again
                stats.settle_errors += 1;
                error!(
                    message_id = %message.id,
                    error = %e,
                    "relay_complete_failed"
                );
            }
        }
        Resolution::Completed
    }

    async fn abandon(&self, message: &QueuedMessage, stats: &mut LoopStats) -> Resolution {
        match self.broker.abandon(&message.id).await {
            Ok(()) => info!(message_id = %message.id, "relay_message_abandoned"),
            Err(e) => {
                // Stays locked until the broker expires the lock
                stats.settle_errors += 1;
                error!(
                    message_id = %message.id,
                    error = %e,
                    critical = true,
                    "relay_abandon_failed"
                );
            }
        }
        Resolution::Abandoned
    }

    fn record(&self, resolution: Resolution, stats: &mut LoopStats) {
        match resolution {
            Resolution::Completed => stats.completed += 1,
            Resolution::Abandoned => stats.abandoned += 1,
        }
    }
}
