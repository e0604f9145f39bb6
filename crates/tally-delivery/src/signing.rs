//! HMAC-SHA256 payload signatures.
//!
//! Every request carries `X-Webhook-Signature: sha256=<hex>`, the lowercase
//! hex HMAC-SHA256 of the exact body bytes keyed by the subscription secret.
//! Subscribers recompute it with [`verify_signature`] or any HMAC library.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Signs a request body, returning the full header value.
///
/// # Errors
///
/// Returns `DeliveryError::ConfigurationError` if the secret is blank or
/// rejected as an HMAC key.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    if secret.trim().is_empty() {
        return Err(DeliveryError::configuration("signing secret is missing"));
    }

    let hex = hmac_hex(secret, body)?;
    Ok(format!("{SIGNATURE_PREFIX}{hex}"))
}

/// Checks a received `X-Webhook-Signature` value against the body.
///
/// Comparison is constant time. Header values without the `sha256=` prefix
/// never verify.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(received) = header_value.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };

    let Ok(expected) = hmac_hex(secret, body) else {
        return false;
    };

    received.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn hmac_hex(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeliveryError::configuration("invalid signing secret"))?;

    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
