//! Webhook endpoint handlers.
//!
//! The webhook handler only authenticates and answers. The broker publish is
//! spawned onto a tracked background task after the response is decided, so
//! broker latency never reaches the caller. A failed publish is logged and
//! nothing else: the caller has already been told the event was accepted.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::broker::MessageBroker;
use crate::web::signature::{validate_signature, SIGNATURE_HEADER};

/// Header naming the event type; logged only.
pub const EVENT_HEADER: &str = "X-GitHub-Event";

/// Header carrying the sender's delivery id; logged only.
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

pub const ACCEPTED_BODY: &str = "Received and queueing for processing.";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub secret: Arc<str>,
    pub broker: Arc<dyn MessageBroker>,
    /// Detached publishes still in flight
    pub publishes: TaskTracker,
}

impl AppState {
    pub fn new(secret: &str, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            secret: Arc::from(secret),
            broker,
            publishes: TaskTracker::new(),
        }
    }
}

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// GitHub webhook endpoint.
///
/// 1. Reads the full body (400 if that fails)
/// 2. Verifies `X-Hub-Signature-256` over it (403 if invalid)
/// 3. Answers 200 and hands the body to a detached publish
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> impl IntoResponse {
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "webhook_body_unreadable");
            return (StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let event = header_str(&headers, EVENT_HEADER).to_string();
    let delivery = header_str(&headers, DELIVERY_HEADER).to_string();
    let signature = header_str(&headers, SIGNATURE_HEADER);

    if !validate_signature(signature, &body, &state.secret) {
        warn!(
            event = %event,
            delivery = %delivery,
            has_signature = !signature.is_empty(),
            "webhook_signature_invalid"
        );
        return (StatusCode::FORBIDDEN, "Forbidden");
    }

    info!(
        event = %event,
        delivery = %delivery,
        body_length = body.len(),
        "webhook_accepted"
    );

    spawn_publish(&state, body, event, delivery);

    (StatusCode::OK, ACCEPTED_BODY)
}

/// Publish `body` on a task that outlives the request.
fn spawn_publish(state: &AppState, body: Bytes, event: String, delivery: String) {
    let broker = Arc::clone(&state.broker);

    state.publishes.spawn(async move {
        match broker.publish(&body).await {
            Ok(()) => info!(
                event = %event,
                delivery = %delivery,
                body_length = body.len(),
                "webhook_enqueued"
            ),
            Err(e) => error!(
                event = %event,
                delivery = %delivery,
                body_length = body.len(),
                error = %e,
                "webhook_publish_failed"
            ),
        }
    });
}
