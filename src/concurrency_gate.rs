//! Per-provider bounded admission control (C3).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const DEFAULT_OPENAI_CONCURRENCY: usize = 5;
const DEFAULT_OTHER_CONCURRENCY: usize = 3;

/// A single provider's semaphore. Acquiring returns an RAII permit that
/// releases on every exit path, including cancellation and panic unwinding,
/// since it's just a dropped `OwnedSemaphorePermit`.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(limit)), limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    /// Acquire a permit, waiting if none is free. There is no acquisition
    /// timeout here by design — callers bound the wait with their own
    /// context deadline and cancel this future to give up.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("ConcurrencyGate semaphore is never closed")
    }
}

/// Registry of per-provider gates, keyed by provider name, with the spec's
/// fixed defaults and `{PROVIDER}_CONCURRENCY` environment overrides.
#[derive(Default, Clone)]
pub struct ConcurrencyGateRegistry {
    inner: Arc<Mutex<HashMap<String, ConcurrencyGate>>>,
}

impl ConcurrencyGateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up (or lazily create) the gate for `provider`, applying the
    /// default-plus-env-override limit on first creation.
    pub fn get(&self, provider: &str) -> ConcurrencyGate {
        let mut map = self.inner.lock().expect("ConcurrencyGateRegistry mutex poisoned");
        if let Some(gate) = map.get(provider) {
            return gate.clone();
        }
        let gate = ConcurrencyGate::new(Self::resolve_limit(provider));
        map.insert(provider.to_string(), gate.clone());
        gate
    }

    fn resolve_limit(provider: &str) -> usize {
        let env_key = format!("{}_CONCURRENCY", provider.to_uppercase());
        if let Ok(value) = std::env::var(&env_key) {
            if let Ok(parsed) = value.parse::<usize>() {
                return parsed;
            }
        }
        if provider.eq_ignore_ascii_case("openai") {
            DEFAULT_OPENAI_CONCURRENCY
        } else {
            DEFAULT_OTHER_CONCURRENCY
        }
    }

    pub fn snapshot(&self) -> Vec<(String, usize, usize)> {
        let map = self.inner.lock().expect("ConcurrencyGateRegistry mutex poisoned");
        let mut entries: Vec<_> =
            map.iter().map(|(name, gate)| (name.clone(), gate.in_flight(), gate.limit())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
