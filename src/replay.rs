//! Replay loop (C10): a fixed-period background task that drains the WAL
//! back into the database once it's reachable again.

use crate::error::PipelineError;
use crate::persistence::PersistenceService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_secs(10);
const REPLAY_BATCH_SIZE: usize = 16;

pub struct ReplayLoop {
    persistence: Arc<PersistenceService>,
    interval: Duration,
    shutdown: Arc<Notify>,
    stopped: Arc<Notify>,
}

impl ReplayLoop {
    pub fn new(persistence: Arc<PersistenceService>, interval: Duration) -> Self {
        Self { persistence, interval, shutdown: Arc::new(Notify::new()), stopped: Arc::new(Notify::new()) }
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs the replay loop until `stop_handle().notify_one()` is called,
    /// finishing any in-flight batch before returning.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    self.stopped.notify_waiters();
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        if !self.persistence.db_is_up().await {
            return;
        }
        let tokens = match self.persistence.wal().read_all().await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "replay tick failed to read WAL");
                return;
            }
        };
        if tokens.is_empty() {
            return;
        }

        for batch in tokens.chunks(REPLAY_BATCH_SIZE) {
            // Routed through `persist()` rather than `database().insert_tokens`
            // directly, so a transient `DbRetryable` failure mid-pass gets the
            // same retry budget a live request's write does instead of
            // aborting the whole tick on the first retryable error.
            match self.persistence.persist(batch).await {
                Ok(()) => {}
                Err(PipelineError::PersistenceDeferred) => {
                    tracing::warn!("replay tick aborted: database still unavailable mid-pass, WAL left intact");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "replay tick aborted: fatal error persisting WAL batch");
                    return;
                }
            }
        }

        if let Err(e) = self.persistence.wal().truncate().await {
            tracing::error!(error = %e, "replay tick failed to truncate WAL after a full pass");
            return;
        }
        if let Err(e) = self.persistence.wal().rotate_if_needed().await {
            tracing::warn!(error = %e, "WAL rotation failed after replay truncate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::token::Token;
    use crate::wal::WriteAheadLog;
    use chrono::Utc;

    fn token(i: u32) -> Token {
        Token { request_id: "r1".into(), attempt_seq: 1, token_index: i, model_id: "gpt-4".into(), text: format!("t{i}"), ts: Utc::now() }
    }

    async fn setup() -> (Arc<PersistenceService>, tempfile::TempDir) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WriteAheadLog::new(dir.path().join("wal.jsonl"), 1_000_000));
        (Arc::new(PersistenceService::new(db, wal)), dir)
    }

    #[tokio::test]
    async fn replays_wal_contents_into_the_database_and_truncates() {
        let (persistence, _dir) = setup().await;
        persistence.wal().append(&[token(0), token(1)]).await.unwrap();

        let replay = ReplayLoop::new(persistence.clone(), Duration::from_secs(10));
        replay.tick().await;

        assert!(persistence.wal().read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn does_nothing_when_wal_is_empty() {
        let (persistence, _dir) = setup().await;
        let replay = ReplayLoop::new(persistence.clone(), Duration::from_secs(10));
        replay.tick().await;
        assert!(persistence.wal().read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_exits_promptly_on_shutdown_signal() {
        let (persistence, _dir) = setup().await;
        let replay = Arc::new(ReplayLoop::new(persistence, Duration::from_secs(3600)));
        let stop = replay.stop_handle();
        let handle = tokio::spawn({
            let replay = replay.clone();
            async move { replay.run().await }
        });
        stop.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
