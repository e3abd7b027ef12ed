//! Shared-secret check for the `api-key` handshake.

/// Compare two byte strings without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Whether `candidate` equals the configured secret.
///
/// An empty configured secret never authenticates anyone.
pub fn verify_secret(secret: &str, candidate: &str) -> bool {
    !secret.is_empty() && constant_time_eq(secret.as_bytes(), candidate.as_bytes())
}
