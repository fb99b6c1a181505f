//! Backoff strategies used by the safe-call retry loop (C4).

use std::time::Duration;

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries.
    Constant { delay: Duration },
    /// Exponentially increasing delay: `base * factor^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, factor: f64, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// `1.5^n`-second backoff, the growth rate the safe-call loop (C4) uses
    /// between retries of a qualifying (rate-limit/timeout) failure: 1.5s,
    /// 2.25s, 3.375s for attempts 1, 2, 3. Expressed as `base=1.5s,
    /// factor=1.5` so `delay(n) = 1.5 * 1.5^(n-1) = 1.5^n`.
    pub fn safe_call_default() -> Self {
        Backoff::Exponential { base: Duration::from_secs_f64(1.5), factor: 1.5, max: None }
    }

    pub fn exponential(base: Duration, factor: f64) -> Self {
        Backoff::Exponential { base, factor, max: None }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(max);
        }
        self
    }

    /// Calculate the delay for a given attempt number (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, factor, max } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let multiplier = factor.powi(exponent);
                let base_secs = base.as_secs_f64();
                let delay_secs = (base_secs * multiplier).max(0.0);
                let computed = Duration::try_from_secs_f64(delay_secs)
                    .unwrap_or(Duration::from_secs(u64::MAX / 1000));
                match max {
                    Some(max) => computed.min(*max),
                    None => computed,
                }
            }
        }
    }
}
