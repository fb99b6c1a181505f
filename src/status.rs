//! Status surface (ambient): a read-only snapshot assembled on demand from
//! the live registries, for an out-of-scope admin HTTP layer to serve.

use crate::buffer::BufferRegistry;
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::concurrency_gate::ConcurrencyGateRegistry;
use crate::persistence::PersistenceService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub provider: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: usize,
    pub in_flight: usize,
    pub concurrency_limit: usize,
    /// Process-local monotonic millis (same clock as the breaker's) the
    /// breaker is open until; `None` unless `circuit_state` is `Open`.
    pub open_until_millis: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BufferStatus {
    pub attempt_key: String,
    pub len: usize,
    pub oldest_token_age_ms: Option<u64>,
    pub last_flush_duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub providers: Vec<ProviderStatus>,
    pub buffers: Vec<BufferStatus>,
    pub wal_size_bytes: u64,
    pub last_db_write_ts: Option<i64>,
    pub token_gap: bool,
    pub attempts_total: u64,
}

/// Latched by the boot-time gap-detection scan; cleared only by a fresh
/// scan at the next boot finding nothing.
#[derive(Default)]
pub struct TokenGapFlag(AtomicBool);

impl TokenGapFlag {
    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct StatusService {
    breakers: CircuitBreakerRegistry,
    gates: ConcurrencyGateRegistry,
    persistence: Arc<PersistenceService>,
    token_gap: Arc<TokenGapFlag>,
    buffers: BufferRegistry,
}

impl StatusService {
    pub fn new(
        breakers: CircuitBreakerRegistry,
        gates: ConcurrencyGateRegistry,
        persistence: Arc<PersistenceService>,
        token_gap: Arc<TokenGapFlag>,
        buffers: BufferRegistry,
    ) -> Self {
        Self { breakers, gates, persistence, token_gap, buffers }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let breaker_snapshot = self.breakers.snapshot();
        let gate_snapshot = self.gates.snapshot();
        let cooldown_millis = self.breakers.cooldown().as_millis() as u64;

        let mut providers: Vec<ProviderStatus> = breaker_snapshot
            .into_iter()
            .map(|(name, state, failures, opened_at_millis)| {
                let (in_flight, limit) = gate_snapshot
                    .iter()
                    .find(|(gate_name, _, _)| gate_name == &name)
                    .map(|(_, in_flight, limit)| (*in_flight, *limit))
                    .unwrap_or((0, 0));
                let open_until_millis =
                    (state == CircuitState::Open).then(|| opened_at_millis.saturating_add(cooldown_millis));
                ProviderStatus {
                    provider: name,
                    circuit_state: state,
                    consecutive_failures: failures,
                    in_flight,
                    concurrency_limit: limit,
                    open_until_millis,
                }
            })
            .collect();
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));

        let buffers = self
            .buffers
            .snapshot()
            .await
            .into_iter()
            .map(|(attempt_key, len, oldest_token_age_ms, last_flush_duration_ms)| BufferStatus {
                attempt_key,
                len,
                oldest_token_age_ms,
                last_flush_duration_ms,
            })
            .collect();

        let attempts_total = self.persistence.database().attempts_total().await.unwrap_or(0);

        StatusSnapshot {
            providers,
            buffers,
            wal_size_bytes: self.persistence.wal().size_bytes(),
            last_db_write_ts: self.persistence.last_db_write_ts(),
            token_gap: self.token_gap.get(),
            attempts_total,
        }
    }
}
