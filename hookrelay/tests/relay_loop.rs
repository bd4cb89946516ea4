//! Consume-forward-acknowledge loop tests.
//!
//! Drive `ForwardLoop` against the in-memory broker with scripted sinks to
//! check settlement, redelivery, receive-error recovery, shutdown and
//! backpressure behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hookrelay::{
    ForwardError, ForwardLoop, ForwardSink, InMemoryBroker, LoopSettings, LoopStats,
    MessageBroker, MessageId,
};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Records bodies; fails the first `fail_first` calls; optionally slow.
#[derive(Default)]
struct RecordingSink {
    bodies: Mutex<Vec<Vec<u8>>>,
    fail_first: AtomicU32,
    delay: Duration,
}

impl RecordingSink {
    fn failing(n: u32) -> Self {
        Self {
            fail_first: AtomicU32::new(n),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ForwardSink for RecordingSink {
    async fn forward(&self, body: &[u8]) -> Result<(), ForwardError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.bodies.lock().unwrap().push(body.to_vec());

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(ForwardError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Blocks every forward until the test releases a permit.
struct GatedSink {
    started: Notify,
    gate: Semaphore,
    calls: AtomicU32,
}

impl GatedSink {
    fn new() -> Self {
        Self {
            started: Notify::new(),
            gate: Semaphore::new(0),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ForwardSink for GatedSink {
    async fn forward(&self, _body: &[u8]) -> Result<(), ForwardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();
        Ok(())
    }
}

fn settings() -> LoopSettings {
    LoopSettings {
        batch_size: 1,
        receive_wait: Duration::from_millis(50),
        receive_error_backoff: Duration::from_millis(20),
        forward_timeout: Duration::from_secs(5),
    }
}

fn spawn_loop(
    broker: Arc<InMemoryBroker>,
    sink: Arc<dyn ForwardSink>,
    settings: LoopSettings,
) -> (CancellationToken, JoinHandle<LoopStats>) {
    let token = CancellationToken::new();
    let relay = ForwardLoop::new(broker, sink, settings);
    let shutdown = token.clone();
    let handle = tokio::spawn(async move { relay.run(shutdown).await });
    (token, handle)
}

/// Poll `condition` until it holds or two seconds pass.
async fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn successful_forward_completes_message() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(RecordingSink::default());
    let body = br#"{"zen":"Keep it logically awesome."}"#.to_vec();
    broker.publish(&body).await.unwrap();

    let (token, handle) = spawn_loop(broker.clone(), sink.clone(), settings());
    eventually(|| sink.bodies().len() == 1 && broker.locked_count() == 0).await;
    token.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(sink.bodies(), vec![body]);
    assert_eq!(stats.received, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.abandoned, 0);

    // Completed messages are gone for good
    assert!(broker.receive(1, Duration::from_millis(20)).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_forward_abandons_and_is_redelivered() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(RecordingSink::failing(2));
    broker.publish(b"retry me").await.unwrap();

    let (token, handle) = spawn_loop(broker.clone(), sink.clone(), settings());
    eventually(|| sink.bodies().len() == 3 && broker.locked_count() == 0).await;
    token.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.abandoned, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.received, 3);
    assert!(sink.bodies().iter().all(|b| b == b"retry me"));
    assert_eq!(broker.ready_count(), 0);
}

#[tokio::test]
async fn every_message_is_settled_exactly_once() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(RecordingSink::failing(1));
    for i in 0..5u8 {
        broker.publish(&[i]).await.unwrap();
    }

    let (token, handle) = spawn_loop(broker.clone(), sink.clone(), settings());
    eventually(|| {
        broker.ready_count() == 0 && broker.locked_count() == 0 && sink.bodies().len() == 6
    })
    .await;
    token.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.received, stats.completed + stats.abandoned);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.settle_errors, 0);
}

#[tokio::test]
async fn receive_errors_back_off_and_recover() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(RecordingSink::default());
    broker.fail_receives(3);
    broker.publish(b"after outage").await.unwrap();

    let started = Instant::now();
    let (token, handle) = spawn_loop(broker.clone(), sink.clone(), settings());
    eventually(|| sink.bodies().len() == 1 && broker.locked_count() == 0).await;
    token.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.receive_errors, 3);
    assert_eq!(stats.completed, 1);
    // Three fixed backoffs of 20ms before the successful receive
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn cancellation_during_backoff_stops_promptly() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_receives(u32::MAX);
    let mut slow_backoff = settings();
    slow_backoff.receive_error_backoff = Duration::from_secs(30);

    let sink = Arc::new(RecordingSink::default());
    let (token, handle) = spawn_loop(broker.clone(), sink, slow_backoff);
    eventually(|| broker.receive_calls() == 1).await;
    token.cancel();

    let stats = timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop kept sleeping after cancellation")
        .unwrap();
    assert_eq!(stats.receive_errors, 1);
}

#[tokio::test]
async fn settle_failures_do_not_stop_the_loop() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(RecordingSink::failing(1));
    broker.fail_abandons(1);
    broker.publish(b"first").await.unwrap();
    broker.publish(b"second").await.unwrap();

    let (token, handle) = spawn_loop(broker.clone(), sink.clone(), settings());
    eventually(|| sink.bodies().len() == 2 && broker.ready_count() == 0).await;
    token.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.settle_errors, 1);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.completed, 1);
    // The message whose abandon failed is still locked
    assert_eq!(broker.locked_count(), 1);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_forward() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(GatedSink::new());
    broker.publish(b"in flight").await.unwrap();
    broker.publish(b"never started").await.unwrap();

    let (token, mut handle) = spawn_loop(broker.clone(), sink.clone(), settings());
    sink.started.notified().await;
    token.cancel();

    // Still forwarding: the loop must not return yet
    assert!(timeout(Duration::from_millis(100), &mut handle).await.is_err());
    assert_eq!(broker.receive_calls(), 1);
    assert_eq!(broker.locked_count(), 1);

    sink.gate.add_permits(1);
    let stats = timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop did not stop after forward resolved")
        .unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(broker.receive_calls(), 1);
    assert_eq!(broker.locked_count(), 0);
    assert_eq!(broker.ready_count(), 1);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_releases_unforwarded_batch_members() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(GatedSink::new());
    for body in [b"a", b"b", b"c"] {
        broker.publish(body).await.unwrap();
    }
    let mut batched = settings();
    batched.batch_size = 3;

    let (token, handle) = spawn_loop(broker.clone(), sink.clone(), batched);
    sink.started.notified().await;
    token.cancel();
    sink.gate.add_permits(1);
    let stats = handle.await.unwrap();

    assert_eq!(stats.received, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.abandoned, 2);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.ready_count(), 2);
    assert_eq!(broker.locked_count(), 0);
}

#[tokio::test]
async fn no_receive_while_forward_outstanding() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(RecordingSink::slow(Duration::from_millis(300)));
    broker.publish(b"one").await.unwrap();
    broker.publish(b"two").await.unwrap();

    let (token, handle) = spawn_loop(broker.clone(), sink.clone(), settings());

    eventually(|| broker.receive_calls() == 1).await;
    sleep(Duration::from_millis(150)).await;
    // First forward still sleeping; second message untouched
    assert_eq!(broker.receive_calls(), 1);
    assert_eq!(broker.ready_count(), 1);
    assert!(sink.bodies().is_empty());

    eventually(|| sink.bodies().len() == 2 && broker.locked_count() == 0).await;
    token.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.completed, 2);
    assert_eq!(sink.bodies(), vec![b"one".to_vec(), b"two".to_vec()]);
}

#[tokio::test]
async fn forward_timeout_abandons_message() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(RecordingSink::slow(Duration::from_secs(10)));
    broker.publish(b"stuck").await.unwrap();
    let mut short = settings();
    short.forward_timeout = Duration::from_millis(50);

    let (token, handle) = spawn_loop(broker.clone(), sink, short);
    let id = MessageId::new(0, 1);
    eventually(|| broker.delivery_count(&id) >= Some(1) && broker.locked_count() == 0).await;
    token.cancel();
    let stats = handle.await.unwrap();

    assert!(stats.abandoned >= 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(broker.ready_count(), 1);
}
