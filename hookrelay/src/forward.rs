//! Outbound delivery to the target tool.
//!
//! One attempt per call, no retries: redelivery is the broker's job once the
//! relay loop abandons a message.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::{error, info};
use url::Url;

use crate::error::ForwardError;

/// Longest response body kept for the failure log line.
const BODY_SNIPPET_LIMIT: usize = 512;

/// Destination for relayed payloads.
#[async_trait]
pub trait ForwardSink: Send + Sync {
    /// Deliver `body` once. `Ok` means the tool accepted it.
    async fn forward(&self, body: &[u8]) -> Result<(), ForwardError>;
}

/// Forwards payloads with an HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    target: Url,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpForwarder {
    /// Build a forwarder with its own pooled client.
    pub fn new(
        target: Url,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ForwardError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            client,
            target,
            auth_token: auth_token.filter(|t| !t.is_empty()),
            timeout,
        })
    }
}

#[async_trait]
impl ForwardSink for HttpForwarder {
    async fn forward(&self, body: &[u8]) -> Result<(), ForwardError> {
        let mut request = self
            .client
            .post(self.target.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                error!(
                    target_url = %self.target,
                    timeout_seconds = self.timeout.as_secs_f64(),
                    error = %e,
                    "forward_timeout"
                );
                return Err(ForwardError::Timeout(self.timeout));
            }
            Err(e) => {
                error!(target_url = %self.target, error = %e, "forward_request_error");
                return Err(ForwardError::Request(e));
            }
        };

        let status = response.status();
        if status.is_success() {
            info!(
                target_url = %self.target,
                status_code = status.as_u16(),
                body_length = body.len(),
                "forward_accepted"
            );
            return Ok(());
        }

        // Best effort; the status alone decides the outcome
        let text = response.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(BODY_SNIPPET_LIMIT).collect();

        error!(
            target_url = %self.target,
            status_code = status.as_u16(),
            body_snippet = %snippet,
            "forward_non_success_status"
        );

        Err(ForwardError::Status {
            status: status.as_u16(),
            body: snippet,
        })
    }
}
