//! Process-local [`MessageBroker`].
//!
//! Behaves like a queue with peek-lock semantics: received messages are
//! locked until completed or abandoned, and abandoned ones go back to the
//! front of the queue. Failures can be injected per operation so the relay
//! loop's error paths can be driven deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{MessageBroker, MessageId, QueuedMessage};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct Stored {
    tag: u64,
    body: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Failures {
    publish: u32,
    receive: u32,
    complete: u32,
    abandon: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Stored>,
    locked: HashMap<u64, Stored>,
    next_tag: u64,
    receive_calls: u64,
    published: Vec<Vec<u8>>,
    failures: Failures,
}

/// In-memory queue with redelivery of abandoned messages.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    ready: Notify,
}

const EPOCH: u64 = 0;

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves the queue itself intact
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `n` publishes.
    pub fn fail_publishes(&self, n: u32) {
        self.state().failures.publish = n;
    }

    /// Fail the next `n` receives.
    pub fn fail_receives(&self, n: u32) {
        self.state().failures.receive = n;
    }

    /// Fail the next `n` completes. The message stays locked.
    pub fn fail_completes(&self, n: u32) {
        self.state().failures.complete = n;
    }

    /// Fail the next `n` abandons. The message stays locked.
    pub fn fail_abandons(&self, n: u32) {
        self.state().failures.abandon = n;
    }

    /// Messages waiting to be received.
    pub fn ready_count(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages received but not yet settled.
    pub fn locked_count(&self) -> usize {
        self.state().locked.len()
    }

    /// Number of `receive` calls made so far, failed ones included.
    pub fn receive_calls(&self) -> u64 {
        self.state().receive_calls
    }

    /// Every body successfully published, in order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.state().published.clone()
    }

    /// How many times the message with `id` has been handed out.
    pub fn delivery_count(&self, id: &MessageId) -> Option<u32> {
        let state = self.state();
        state
            .locked
            .get(&id.tag)
            .or_else(|| state.ready.iter().find(|m| m.tag == id.tag))
            .map(|m| m.deliveries)
    }

    fn take_failure(counter: &mut u32, operation: &str) -> Result<(), BrokerError> {
        if *counter > 0 {
            *counter -= 1;
            return Err(BrokerError::Unavailable(format!("injected {operation} failure")));
        }
        Ok(())
    }

    fn take_ready(&self, max_count: usize) -> Vec<QueuedMessage> {
        let mut state = self.state();
        let mut batch = Vec::new();

        while batch.len() < max_count {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.deliveries += 1;
            batch.push(QueuedMessage {
                id: MessageId::new(EPOCH, message.tag),
                body: message.body.clone(),
                redelivered: message.deliveries > 1,
            });
            state.locked.insert(message.tag, message);
        }

        batch
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, body: &[u8]) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            Self::take_failure(&mut state.failures.publish, "publish")?;

            state.next_tag += 1;
            let tag = state.next_tag;
            state.ready.push_back(Stored {
                tag,
                body: body.to_vec(),
                deliveries: 0,
            });
            state.published.push(body.to_vec());
        }

        self.ready.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<QueuedMessage>, BrokerError> {
        {
            let mut state = self.state();
            state.receive_calls += 1;
            Self::take_failure(&mut state.failures.receive, "receive")?;
        }

        let deadline = Instant::now() + max_wait;

        loop {
            // Register interest before checking, so a publish in between is not missed
            let notified = self.ready.notified();

            let batch = self.take_ready(max_count);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn complete(&self, id: &MessageId) -> Result<(), BrokerError> {
        let mut state = self.state();
        Self::take_failure(&mut state.failures.complete, "complete")?;

        if id.epoch != EPOCH || state.locked.remove(&id.tag).is_none() {
            return Err(BrokerError::UnknownMessage(*id));
        }
        Ok(())
    }

    async fn abandon(&self, id: &MessageId) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            Self::take_failure(&mut state.failures.abandon, "abandon")?;

            if id.epoch != EPOCH {
                return Err(BrokerError::UnknownMessage(*id));
            }
            let Some(message) = state.locked.remove(&id.tag) else {
                return Err(BrokerError::UnknownMessage(*id));
            };
            state.ready.push_front(message);
        }

        self.ready.notify_waiters();
        Ok(())
    }
}
