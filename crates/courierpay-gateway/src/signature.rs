//! Webhook signature verification
//!
//! Inbound processor events are authenticated with HMAC-SHA256 over the raw
//! payload bytes using a shared secret. Comparison is constant-time via
//! `Mac::verify_slice`; a bad hex header and a mismatched digest are
//! indistinguishable to the caller.

use courierpay_types::{CourierPayError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex signature for a payload (used by tests and by outbound
/// signing if the engine ever emits webhooks of its own).
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded signature header against the raw payload.
pub fn verify(payload: &[u8], signature_hex: &str, secret: &str) -> Result<()> {
    let provided =
        hex::decode(signature_hex.trim()).map_err(|_| CourierPayError::AuthenticationFailure)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(&provided)
        .map_err(|_| CourierPayError::AuthenticationFailure)
}
