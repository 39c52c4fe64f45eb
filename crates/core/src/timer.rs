//! Cancellable deadlines
//!
//! Every timeout in the engine is a first-class token: it can be checked,
//! cancelled, and cancelled again without effect. Callers never rely on a
//! timer being collected for them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cancellable deadline token.
///
/// Cloning shares the cancellation flag, so any holder may cancel and all
/// holders observe it. Cancellation is idempotent.
#[derive(Debug, Clone)]
pub struct TimerToken {
    expires_at: Instant,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
}

impl TimerToken {
    /// Start a token expiring `timeout_ms` from now.
    pub fn after_ms(timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        Self {
            expires_at: Instant::now() + timeout,
            timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the deadline has passed and the token was not cancelled.
    pub fn expired(&self) -> bool {
        !self.is_cancelled() && Instant::now() >= self.expires_at
    }

    /// Time remaining before expiry (zero once passed).
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Cancel the token. Idempotent; an expired token can still be
    /// cancelled (the cancellation wins for `expired()` checks).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
