//! Envelope signing and verification.
//!
//! This is the deployment's authentication boundary for the realtime channel:
//! envelopes are signed with HMAC-SHA256 over the serialized `data` payload
//! using a shared secret, and verified with constant-time comparison. It is a
//! real signing scheme, but key distribution is a deployment concern; this
//! module makes no further trust guarantees.

use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const BLOCK_SIZE: usize = 64;

/// Sign an envelope's data payload, returning a hex digest.
pub fn sign_payload(secret: &str, data: &Value) -> String {
    let payload = serde_json::to_string(data).unwrap_or_default();
    hex::encode(hmac_sha256(secret.as_bytes(), payload.as_bytes()))
}

/// Verify a hex signature against an envelope's data payload.
pub fn verify_payload(secret: &str, data: &Value, signature: &str) -> bool {
    constant_time_compare(&sign_payload(secret, data), signature)
}

/// HMAC-SHA256 (RFC 2104) over sha2.
fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let digest = Sha256::digest(key);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update(key_block.map(|b| b ^ 0x36));
    inner.update(message);
    let inner_digest = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(key_block.map(|b| b ^ 0x5c));
    outer.update(inner_digest);
    outer.finalize().into()
}

/// Perform constant-time string comparison.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
