//! Single-attempt bounded buffer (C6): `Idle -> Buffering -> Flushing ->
//! (Idle | Flushing-with-error)`.

use crate::error::PipelineError;
use crate::provider::CallContext;
use crate::token::Token;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

pub const DEFAULT_FLUSH_SIZE: usize = 16;
pub const DEFAULT_FLUSH_AGE: Duration = Duration::from_secs(1);

/// Where a frozen batch goes. Implemented by the persistence service (C9)
/// in production; tests use a simple recording stub.
#[async_trait::async_trait]
pub trait Drain: Send + Sync {
    async fn drain(&self, batch: Vec<Token>) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Buffering,
    Flushing,
    FlushingError,
}

struct Inner {
    phase: Phase,
    tokens: Vec<Token>,
    first_added_at: Option<Instant>,
    next_expected_index: u32,
    epoch: u64,
    last_flush_duration_ms: Option<u64>,
}

/// A per-attempt buffer. One `Buffer` is created per attempt and discarded
/// once the attempt ends.
pub struct Buffer {
    attempt_key: String,
    inner: Mutex<Inner>,
    ready: Notify,
    drain: Arc<dyn Drain>,
    flush_size: usize,
    flush_age: Duration,
}

impl Buffer {
    pub fn new(attempt_key: impl Into<String>, drain: Arc<dyn Drain>) -> Arc<Self> {
        Self::with_triggers(attempt_key, drain, DEFAULT_FLUSH_SIZE, DEFAULT_FLUSH_AGE)
    }

    pub fn with_triggers(
        attempt_key: impl Into<String>,
        drain: Arc<dyn Drain>,
        flush_size: usize,
        flush_age: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            attempt_key: attempt_key.into(),
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                tokens: Vec::new(),
                first_added_at: None,
                next_expected_index: 0,
                epoch: 0,
                last_flush_duration_ms: None,
            }),
            ready: Notify::new(),
            drain,
            flush_size,
            flush_age,
        })
    }

    pub fn attempt_key(&self) -> &str {
        &self.attempt_key
    }

    /// Appends `token`, back-pressuring the caller while a drain is in
    /// flight. Returns promptly with `Cancelled` instead of blocking if
    /// `ctx` is cancelled while waiting.
    pub async fn add(self: &Arc<Self>, token: Token, ctx: &CallContext) -> Result<(), PipelineError> {
        loop {
            let mut guard = self.inner.lock().await;
            match guard.phase {
                Phase::FlushingError => return Err(PipelineError::Cancelled),
                Phase::Flushing => {
                    // Register before dropping the guard, so a `notify_waiters()`
                    // landing in the gap between the phase check and the wait
                    // can't be missed.
                    let notified = self.ready.notified();
                    drop(guard);
                    tokio::select! {
                        _ = notified => continue,
                        _ = ctx.cancelled() => return Err(PipelineError::Cancelled),
                    }
                }
                Phase::Idle | Phase::Buffering => {
                    assert_eq!(
                        token.token_index, guard.next_expected_index,
                        "token_index must be contiguous within an attempt"
                    );
                    if guard.phase == Phase::Idle {
                        guard.phase = Phase::Buffering;
                        guard.first_added_at = Some(Instant::now());
                        self.spawn_age_watcher(guard.epoch);
                    }
                    guard.next_expected_index += 1;
                    guard.tokens.push(token);
                    let should_flush = guard.tokens.len() >= self.flush_size;
                    if should_flush {
                        let batch = std::mem::take(&mut guard.tokens);
                        guard.phase = Phase::Flushing;
                        drop(guard);
                        self.run_drain(batch).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn spawn_age_watcher(self: &Arc<Self>, epoch: u64) {
        let this = self.clone();
        let flush_age = self.flush_age;
        tokio::spawn(async move {
            tokio::time::sleep(flush_age).await;
            let batch = {
                let mut guard = this.inner.lock().await;
                if guard.phase != Phase::Buffering || guard.epoch != epoch || guard.tokens.is_empty() {
                    return;
                }
                let batch = std::mem::take(&mut guard.tokens);
                guard.phase = Phase::Flushing;
                batch
            };
            this.run_drain(batch).await;
        });
    }

    async fn run_drain(self: &Arc<Self>, batch: Vec<Token>) {
        let start = Instant::now();
        let result = self.drain.drain(batch).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let mut guard = self.inner.lock().await;
        guard.last_flush_duration_ms = Some(elapsed_ms);
        match result {
            Ok(()) => {
                guard.phase = Phase::Idle;
                guard.first_added_at = None;
                guard.epoch += 1;
            }
            Err(_) => {
                guard.phase = Phase::FlushingError;
            }
        }
        drop(guard);
        self.ready.notify_waiters();
    }

    /// Used by graceful shutdown (C13): atomically moves a non-empty
    /// `Buffering` buffer to `Flushing` and performs one final drain. A
    /// no-op if the buffer is already `Idle`.
    pub async fn drain_all(self: &Arc<Self>) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock().await;
        match guard.phase {
            Phase::Idle => return Ok(()),
            Phase::FlushingError => return Err(PipelineError::Cancelled),
            Phase::Flushing => {
                // Register before dropping the guard — see `add()`'s
                // `Flushing` branch for why this ordering matters.
                let notified = self.ready.notified();
                drop(guard);
                notified.await;
            }
            Phase::Buffering => {
                let batch = std::mem::take(&mut guard.tokens);
                guard.phase = Phase::Flushing;
                drop(guard);
                self.run_drain(batch).await;
            }
        }
        let guard = self.inner.lock().await;
        if guard.phase == Phase::FlushingError {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.tokens.len()
    }

    pub async fn oldest_age(&self) -> Option<Duration> {
        self.inner.lock().await.first_added_at.map(|t| t.elapsed())
    }

    pub async fn last_flush_duration_ms(&self) -> Option<u64> {
        self.inner.lock().await.last_flush_duration_ms
    }
}

/// Tracks every currently-live buffer by attempt key, for the status
/// surface (ambient) to read lengths, oldest-token age, and last flush
/// duration off of without the orchestrator (C12) exposing its internals
/// directly.
#[derive(Default, Clone)]
pub struct BufferRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<Buffer>>>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, buffer: Arc<Buffer>) {
        self.inner.lock().await.insert(buffer.attempt_key().to_string(), buffer);
    }

    pub async fn deregister(&self, attempt_key: &str) {
        self.inner.lock().await.remove(attempt_key);
    }

    /// `(attempt_key, len, oldest_token_age_ms, last_flush_duration_ms)` for
    /// every still-live buffer, sorted by attempt key.
    pub async fn snapshot(&self) -> Vec<(String, usize, Option<u64>, Option<u64>)> {
        let map = self.inner.lock().await;
        let mut entries = Vec::with_capacity(map.len());
        for (attempt_key, buffer) in map.iter() {
            let len = buffer.len().await;
            let oldest_token_age_ms = buffer.oldest_age().await.map(|age| age.as_millis() as u64);
            let last_flush_duration_ms = buffer.last_flush_duration_ms().await;
            entries.push((attempt_key.clone(), len, oldest_token_age_ms, last_flush_duration_ms));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
