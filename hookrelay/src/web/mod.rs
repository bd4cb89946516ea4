//! Web server module for the signed webhook ingress.
//!
//! - `POST /webhook`: verify, answer, enqueue in the background
//! - `GET /healthz`: liveness
//!
//! Other methods on `/webhook` get 405 from the method router.

pub mod handlers;
pub mod signature;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{health, webhook, AppState, ACCEPTED_BODY, DELIVERY_HEADER, EVENT_HEADER};
pub use signature::{validate_signature, SIGNATURE_HEADER};

/// Build the receiver router.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/webhook", post(webhook))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
