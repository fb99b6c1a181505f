//! Boot and shutdown (C13): migrations, gap detection, starting the replay
//! loop, and the graceful shutdown sequence on an OS signal.

use crate::buffer::Buffer;
use crate::db::Database;
use crate::persistence::PersistenceService;
use crate::replay::ReplayLoop;
use crate::status::TokenGapFlag;
use std::sync::Arc;
use std::time::Duration;

const GAP_REPORT_LIMIT: usize = 10;

/// Scans `(request_id, attempt_seq, token_index)` for adjacent pairs
/// missing a step, returning the first `limit` findings as
/// `(request_id, attempt_seq, expected_index)`.
pub async fn detect_token_gaps(db: &Database, limit: usize) -> Result<Vec<(String, u32, u32)>, crate::error::PipelineError> {
    let rows = db.ordered_token_indices().await?;
    let mut gaps = Vec::new();
    let mut prev: Option<(&str, u32, u32)> = None;
    for (request_id, attempt_seq, token_index) in &rows {
        if let Some((prev_request, prev_attempt, prev_index)) = prev {
            if prev_request == request_id && prev_attempt == *attempt_seq && *token_index != prev_index + 1 {
                gaps.push((request_id.clone(), *attempt_seq, prev_index + 1));
                if gaps.len() >= limit {
                    break;
                }
            }
        }
        prev = Some((request_id, *attempt_seq, *token_index));
    }
    Ok(gaps)
}

pub struct BootOutcome {
    pub persistence: Arc<PersistenceService>,
    pub replay: Arc<ReplayLoop>,
    pub token_gap: Arc<TokenGapFlag>,
}

/// Runs migrations (implicitly, via `Database::connect`), the gap-detection
/// scan, and starts the replay loop in the background.
pub async fn boot(
    database_url: &str,
    wal_path: impl Into<std::path::PathBuf>,
    wal_max_size_bytes: u64,
    replay_interval: Duration,
) -> Result<BootOutcome, crate::error::PipelineError> {
    let db = Arc::new(Database::connect(database_url).await?);
    let wal = Arc::new(crate::wal::WriteAheadLog::new(wal_path, wal_max_size_bytes));
    let persistence = Arc::new(PersistenceService::new(db.clone(), wal));

    let token_gap = Arc::new(TokenGapFlag::default());
    let gaps = detect_token_gaps(&db, GAP_REPORT_LIMIT).await?;
    if !gaps.is_empty() {
        for (request_id, attempt_seq, expected_index) in &gaps {
            tracing::warn!(
                request_id = %request_id,
                attempt_seq,
                expected_index,
                "boot-time scan found a missing token index"
            );
        }
        tracing::warn!(count = gaps.len(), "boot-time scan found token index gaps");
        token_gap.set(true);
    } else {
        token_gap.set(false);
    }

    let replay = Arc::new(ReplayLoop::new(persistence.clone(), replay_interval));
    let replay_handle = replay.clone();
    tokio::spawn(async move { replay_handle.run().await });

    Ok(BootOutcome { persistence, replay, token_gap })
}

/// Orchestrates the shutdown sequence: drain every still-live buffer
/// (bounded by `grace`), stop the replay loop, then close the database pool.
pub async fn shutdown(replay: &ReplayLoop, live_buffers: &[Arc<Buffer>], db: &Database, grace: Duration) {
    tracing::info!("shutdown signal received, draining in-flight buffers");
    let drains = live_buffers.iter().map(|buffer| buffer.drain_all());
    let _ = tokio::time::timeout(grace, futures::future::join_all(drains)).await;

    replay.stop_handle().notify_one();
    db.close().await;
    tracing::info!("shutdown sequence complete");
}

/// Waits for a termination signal (SIGINT, or SIGTERM on Unix).
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
