//! Database writer (C8): the durable sink for tokens and attempt/request
//! bookkeeping, with idempotent bulk inserts so a replayed batch can never
//! double-write a token.

use crate::error::PipelineError;
use crate::token::{Attempt, AttemptStatus, Request, RequestStatus, Token};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// How a write against the database resolved, for the persistence service
/// (C9) to decide whether to fall back to the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok,
    /// A transient failure (lock contention, connection drop) — worth
    /// retrying shortly, and safe to leave in the WAL meanwhile.
    DbRetryable,
    /// The database looks unreachable entirely; stop trying it for now.
    DbUnavailable,
    /// Disk-level failure (out of space, corrupt file) — not expected to
    /// resolve itself; surfaced distinctly so operators can page on it.
    FatalDisk,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, PipelineError> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(database_url).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn connect_file(path: &Path) -> Result<Self, PipelineError> {
        Self::connect(&format!("sqlite:{}?mode=rwc", path.display())).await
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, PipelineError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                request_id TEXT NOT NULL,
                attempt_seq INTEGER NOT NULL,
                token_index INTEGER NOT NULL,
                model_id TEXT NOT NULL,
                text TEXT NOT NULL,
                ts INTEGER NOT NULL,
                PRIMARY KEY (request_id, attempt_seq, token_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempts (
                request_id TEXT NOT NULL,
                attempt_seq INTEGER NOT NULL,
                model_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                error_kind TEXT,
                PRIMARY KEY (request_id, attempt_seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                request_id TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                models TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_request ON tokens(request_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Bulk-inserts `tokens`, ignoring rows that already exist (same
    /// primary key) so replaying a batch the database already has is a
    /// no-op rather than an error.
    pub async fn insert_tokens(&self, tokens: &[Token]) -> WriteOutcome {
        if tokens.is_empty() {
            return WriteOutcome::Ok;
        }
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return classify_sqlx_error(&e),
        };
        for token in tokens {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO tokens (request_id, attempt_seq, token_index, model_id, text, ts) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&token.request_id)
            .bind(token.attempt_seq as i64)
            .bind(token.token_index as i64)
            .bind(&token.model_id)
            .bind(&token.text)
            .bind(token.ts.timestamp_millis())
            .execute(&mut *tx)
            .await;
            if let Err(e) = result {
                return classify_sqlx_error(&e);
            }
        }
        match tx.commit().await {
            Ok(()) => WriteOutcome::Ok,
            Err(e) => classify_sqlx_error(&e),
        }
    }

    pub async fn upsert_attempt(&self, attempt: &Attempt) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO attempts (request_id, attempt_seq, model_id, provider, status, started_at, ended_at, error_kind) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(request_id, attempt_seq) DO UPDATE SET \
             status = excluded.status, ended_at = excluded.ended_at, error_kind = excluded.error_kind",
        )
        .bind(&attempt.request_id)
        .bind(attempt.attempt_seq as i64)
        .bind(&attempt.model_id)
        .bind(&attempt.provider)
        .bind(attempt_status_str(attempt.status))
        .bind(attempt.started_at.timestamp_millis())
        .bind(attempt.ended_at.map(|t| t.timestamp_millis()))
        .bind(&attempt.error_kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_request(&self, request: &Request) -> Result<(), PipelineError> {
        let models_json = serde_json::to_string(&request.models)
            .map_err(|e| PipelineError::Fatal { provider: "db".into(), message: e.to_string() })?;
        sqlx::query(
            "INSERT INTO requests (request_id, prompt, models, status, created_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(request_id) DO UPDATE SET status = excluded.status",
        )
        .bind(&request.request_id)
        .bind(&request.prompt)
        .bind(models_json)
        .bind(request_status_str(request.status))
        .bind(request.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `(request_id, attempt_seq, token_index)` for every stored token,
    /// ordered so that all indices for one attempt are contiguous — the
    /// shape the boot-time gap scan needs.
    pub async fn ordered_token_indices(&self) -> Result<Vec<(String, u32, u32)>, PipelineError> {
        let rows = sqlx::query(
            "SELECT request_id, attempt_seq, token_index FROM tokens \
             ORDER BY request_id, attempt_seq, token_index",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("request_id"), row.get::<i64, _>("attempt_seq") as u32, row.get::<i64, _>("token_index") as u32))
            .collect())
    }

    /// Total persisted token count, for the status surface's
    /// `attempts_total` field.
    pub async fn attempts_total(&self) -> Result<u64, PipelineError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM attempts").fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    /// The most recent token write timestamp (millis), used by boot-time
    /// gap detection to size the initial replay window.
    pub async fn last_write_ts(&self) -> Result<Option<i64>, PipelineError> {
        let row = sqlx::query("SELECT MAX(ts) as ts FROM tokens").fetch_one(&self.pool).await?;
        Ok(row.get::<Option<i64>, _>("ts"))
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Closes the pool. Subsequent writes resolve to `WriteOutcome::DbUnavailable`
    /// rather than panicking, which integration tests use to simulate an
    /// outage without tearing down the backing file.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn purge_older_than(&self, cutoff_ts_millis: i64) -> Result<u64, PipelineError> {
        let result = sqlx::query("DELETE FROM tokens WHERE ts < ?")
            .bind(cutoff_ts_millis)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn attempt_status_str(status: AttemptStatus) -> &'static str {
    match status {
        AttemptStatus::Pending => "pending",
        AttemptStatus::Streaming => "streaming",
        AttemptStatus::Completed => "completed",
        AttemptStatus::Failed => "failed",
        AttemptStatus::Fallback => "fallback",
    }
}

fn request_status_str(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending => "pending",
        RequestStatus::InProgress => "in_progress",
        RequestStatus::Completed => "completed",
        RequestStatus::Failed => "failed",
    }
}

fn classify_sqlx_error(err: &sqlx::Error) -> WriteOutcome {
    match err {
        sqlx::Error::Io(_) => WriteOutcome::FatalDisk,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => WriteOutcome::DbUnavailable,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_lowercase();
            if message.contains("disk") || message.contains("readonly") || message.contains("corrupt") {
                WriteOutcome::FatalDisk
            } else if message.contains("locked") || message.contains("busy") {
                WriteOutcome::DbRetryable
            } else {
                WriteOutcome::DbRetryable
            }
        }
        _ => WriteOutcome::DbRetryable,
    }
}
