//! Per-provider circuit breaker (C2).
//!
//! `Closed -> Open` after `failure_threshold` consecutive *qualifying*
//! failures (`RateLimit | Timeout | ProviderDown`; `Fatal` never counts).
//! `Open -> HalfOpen` once the cooldown elapses, admitting exactly one
//! probe. `HalfOpen -> Closed` on probe success, `HalfOpen -> Open` (fresh
//! cooldown) on probe failure.

use crate::clock::{Clock, MonotonicClock};
use crate::error::PipelineError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            CLOSED => CircuitState::Closed,
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            other => unreachable!("invalid circuit breaker state byte {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, cooldown: Duration::from_secs(30) }
    }
}

struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
        }
    }
}

/// A single provider's breaker. Cheap to clone; shares state via `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { state: Arc::new(CircuitBreakerState::new()), config, clock: Arc::new(MonotonicClock::default()) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn current_state(&self) -> CircuitState {
        self.state.state.load(Ordering::SeqCst).into()
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::SeqCst)
    }

    /// Millis (per `self.clock`) at which the breaker last tripped open; `0`
    /// if it has never opened. Used to surface a per-provider open-until time.
    pub fn opened_at_millis(&self) -> u64 {
        self.state.opened_at_millis.load(Ordering::SeqCst)
    }

    /// Every caller that receives `Ok(())` must call exactly one of
    /// `record_success`/`record_failure` afterward. A single caller per
    /// provider will observe `Ok(())` while the breaker is `HalfOpen` — it
    /// is that call's probe to run.
    pub fn gate(&self, provider: &str) -> Result<(), PipelineError> {
        loop {
            let current = self.state.state.load(Ordering::SeqCst);
            match current {
                CLOSED => return Ok(()),
                OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::SeqCst);
                    let now = self.clock.now_millis();
                    if now >= opened_at.saturating_add(self.config.cooldown.as_millis() as u64) {
                        // Try to become the probe holder.
                        if self
                            .state
                            .state
                            .compare_exchange(OPEN, HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            return Ok(());
                        }
                        // Someone else flipped state concurrently; re-check.
                        continue;
                    }
                    return Err(PipelineError::ProviderDown { provider: provider.to_string() });
                }
                HALF_OPEN => {
                    // A probe is already in flight; reject until it resolves.
                    return Err(PipelineError::ProviderDown { provider: provider.to_string() });
                }
                _ => unreachable!(),
            }
        }
    }

    pub fn record_success(&self) {
        self.state.failure_count.store(0, Ordering::SeqCst);
        let _ = self.state.state.compare_exchange(
            HALF_OPEN,
            CLOSED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// `qualifying` must be true only for `RateLimit | Timeout |
    /// ProviderDown`; `Fatal` failures must never reach here with `true`.
    pub fn record_failure(&self, qualifying: bool) {
        if !qualifying {
            return;
        }
        let current = self.state.state.load(Ordering::SeqCst);
        match current {
            HALF_OPEN => {
                self.open_now();
            }
            CLOSED => {
                let failures = self.state.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.open_now();
                }
            }
            OPEN => {}
            _ => unreachable!(),
        }
    }

    fn open_now(&self) {
        self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::SeqCst);
        self.state.state.store(OPEN, Ordering::SeqCst);
    }
}

/// Registry of per-provider breakers, keyed by provider name.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), config }
    }

    pub fn get(&self, provider: &str) -> CircuitBreaker {
        let mut map = self.inner.lock().expect("CircuitBreakerRegistry mutex poisoned");
        map.entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()))
            .clone()
    }

    /// `(provider, state, consecutive_failures, opened_at_millis)` per breaker.
    pub fn snapshot(&self) -> Vec<(String, CircuitState, usize, u64)> {
        let map = self.inner.lock().expect("CircuitBreakerRegistry mutex poisoned");
        let mut entries: Vec<_> = map
            .iter()
            .map(|(name, cb)| (name.clone(), cb.current_state(), cb.failure_count(), cb.opened_at_millis()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
