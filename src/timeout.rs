//! Timeout policy for bounding a single async operation's duration.
//!
//! Used for C2's probe deadline (5s) and C1 adaptors' own per-try transport
//! deadline. The spec's concurrency gate (C3) deliberately has *no*
//! acquisition timeout of its own — callers bound that with their own
//! context deadline instead — so this policy is never used for gate
//! acquisition.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Policy that enforces a maximum duration on an async operation.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

/// The operation did not complete before the configured deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    pub elapsed: Duration,
    pub timeout: Duration,
}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Runs `operation`, returning `Err(Elapsed)` if it doesn't finish
    /// before the deadline. On timeout the inner future is dropped (not
    /// forcibly aborted); callers relying on partial work should use
    /// cancellation-safe primitives.
    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T, Elapsed>
    where
        Fut: Future<Output = T> + Send,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, operation).await {
            Ok(value) => Ok(value),
            Err(_) => Err(Elapsed { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
