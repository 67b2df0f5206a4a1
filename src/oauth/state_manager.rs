//! CSRF state handling for the authorization callback.
//!
//! Only one authorization request is outstanding at a time: issuing a new
//! state replaces the previous one, and any callback consumes it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Random bytes per state value (encodes to 43 characters)
const NONCE_BYTES: usize = 32;

struct PendingState {
    nonce: String,
    issued_at: DateTime<Utc>,
}

/// Single-use CSRF state issuance and verification.
pub struct CallbackValidator {
    pending: Mutex<Option<PendingState>>,
    ttl: Duration,
}

impl CallbackValidator {
    /// Create a validator whose states expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(None),
            ttl,
        }
    }

    /// Generate a new state value and make it the pending one
    pub fn issue(&self) -> String {
        let nonce = generate_nonce();
        *self.lock() = Some(PendingState {
            nonce: nonce.clone(),
            issued_at: Utc::now(),
        });
        nonce
    }

    /// Check `supplied` against the pending state.
    ///
    /// The pending state is cleared whatever the outcome, so a value can be
    /// accepted at most once.
    pub fn validate(&self, supplied: &str) -> bool {
        self.validate_at(supplied, Utc::now())
    }

    fn validate_at(&self, supplied: &str, now: DateTime<Utc>) -> bool {
        let Some(pending) = self.lock().take() else {
            debug!("Callback state received with no authorization pending");
            return false;
        };

        if now - pending.issued_at > self.ttl {
            debug!("Callback state expired");
            return false;
        }

        constant_time_eq(pending.nonce.as_bytes(), supplied.as_bytes())
    }

    /// Drop the pending state without checking anything
    pub fn discard(&self) {
        self.lock().take();
    }

    pub fn has_pending(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingState>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Comparison whose duration does not depend on where the inputs differ
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_single_use() {
        let validator = CallbackValidator::new(Duration::minutes(10));

        let state = validator.issue();
        assert!(validator.has_pending());

        // First validation succeeds
        assert!(validator.validate(&state));

        // Second validation fails (already consumed)
        assert!(!validator.validate(&state));
        assert!(!validator.has_pending());
    }

    #[test]
    fn test_state_without_pending_request() {
        let validator = CallbackValidator::new(Duration::minutes(10));
        assert!(!validator.validate("anything"));
        assert!(!validator.validate(""));
    }

    #[test]
    fn test_mismatch_consumes_state() {
        let validator = CallbackValidator::new(Duration::minutes(10));
        let state = validator.issue();

        assert!(!validator.validate("wrong"));
        // The real value no longer works either
        assert!(!validator.validate(&state));
    }

    #[test]
    fn test_expired_state_rejected() {
        let validator = CallbackValidator::new(Duration::minutes(10));
        let state = validator.issue();

        let later = Utc::now() + Duration::minutes(11);
        assert!(!validator.validate_at(&state, later));
    }

    #[test]
    fn test_new_issue_replaces_previous() {
        let validator = CallbackValidator::new(Duration::minutes(10));
        let first = validator.issue();
        let second = validator.issue();

        assert_ne!(first, second);
        assert!(!validator.validate(&first));

        let third = validator.issue();
        assert!(validator.validate(&third));
    }

    #[test]
    fn test_discard() {
        let validator = CallbackValidator::new(Duration::minutes(10));
        let state = validator.issue();
        validator.discard();
        assert!(!validator.validate(&state));
    }

    #[test]
    fn test_nonce_encoding() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 43);
        assert!(nonce
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(URL_SAFE_NO_PAD.decode(&nonce).unwrap().len(), NONCE_BYTES);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
