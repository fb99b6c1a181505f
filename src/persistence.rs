//! Persistence service (C9): the single write path every buffer drains
//! into, falling back to the WAL when the database can't take a batch.

use crate::buffer::Drain;
use crate::db::{Database, WriteOutcome};
use crate::error::PipelineError;
use crate::token::Token;
use crate::wal::WriteAheadLog;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub struct PersistenceService {
    db: Arc<Database>,
    wal: Arc<WriteAheadLog>,
    last_db_write_millis: AtomicI64,
    db_retryable_budget: usize,
}

impl PersistenceService {
    pub fn new(db: Arc<Database>, wal: Arc<WriteAheadLog>) -> Self {
        Self { db, wal, last_db_write_millis: AtomicI64::new(0), db_retryable_budget: 3 }
    }

    /// `Ok(())` on a direct database write, `Ok(())` on a WAL-deferred
    /// write too (both are "not lost" from the caller's perspective — only
    /// `PersistenceFatal` is a true failure).
    pub async fn persist(&self, batch: &[Token]) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut outcome = self.db.insert_tokens(batch).await;
        let mut tries = 0;
        while outcome == WriteOutcome::DbRetryable && tries < self.db_retryable_budget {
            tries += 1;
            outcome = self.db.insert_tokens(batch).await;
        }

        match outcome {
            WriteOutcome::Ok => {
                self.last_db_write_millis.store(now_millis(), Ordering::SeqCst);
                Ok(())
            }
            WriteOutcome::FatalDisk => {
                Err(PipelineError::PersistenceFatal(Box::new(PipelineError::Fatal {
                    provider: "db".into(),
                    message: "disk-level database failure".into(),
                })))
            }
            WriteOutcome::DbUnavailable | WriteOutcome::DbRetryable => match self.wal.append(batch).await {
                Ok(()) => {
                    tracing::warn!(batch_len = batch.len(), "database unavailable, deferred to WAL");
                    Err(PipelineError::PersistenceDeferred)
                }
                Err(e) => Err(PipelineError::PersistenceFatal(Box::new(e))),
            },
        }
    }

    pub async fn db_is_up(&self) -> bool {
        self.db.ping().await
    }

    pub fn last_db_write_ts(&self) -> Option<i64> {
        let ts = self.last_db_write_millis.load(Ordering::SeqCst);
        if ts == 0 {
            None
        } else {
            Some(ts)
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `PersistenceService::persist` treats `PersistenceDeferred` as a
/// successful drain from C6's point of view — only `PersistenceFatal`
/// should latch the buffer's error state.
#[async_trait::async_trait]
impl Drain for PersistenceService {
    async fn drain(&self, batch: Vec<Token>) -> Result<(), PipelineError> {
        match self.persist(&batch).await {
            Ok(()) => Ok(()),
            Err(PipelineError::PersistenceDeferred) => Ok(()),
            Err(other) => Err(other),
        }
    }
}
