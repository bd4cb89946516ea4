//! GitHub webhook signature verification.
//!
//! GitHub signs each delivery with HMAC-SHA256 over the raw request body and
//! sends the hex digest in `X-Hub-Signature-256` as `sha256=<hex>`.
//! Reference: https://docs.github.com/en/webhooks/using-webhooks/validating-webhook-deliveries

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify a webhook signature header against the raw body.
///
/// Returns `false` for anything other than a well-formed `sha256=<hex>`
/// header whose digest matches. Never errors: this is a gate, not a
/// diagnostic. The comparison runs in constant time.
///
/// An empty `secret` is accepted as a key; refusing it is the caller's call.
pub fn validate_signature(signature_header: &str, body: &[u8], secret: &str) -> bool {
    let Some(signature_hex) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        warn!(
            header_length = signature_header.len(),
            "signature_prefix_missing"
        );
        return false;
    };

    let signature = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "signature_decode_failed");
            return false;
        }
    };

    // HMAC accepts keys of any length, including empty ones
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            warn!("signature_invalid_key");
            return false;
        }
    };
    mac.update(body);

    let valid = mac.verify_slice(&signature).is_ok();

    if !valid {
        warn!(
            body_length = body.len(),
            signature_length = signature.len(),
            "signature_mismatch"
        );
    }

    valid
}
