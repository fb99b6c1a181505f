//! Write-ahead log (C7): the durability floor token buffers fall back to
//! when the database is unavailable.
//!
//! Append-only JSONL, one compact-key object per line:
//! `{"r":request_id,"a":attempt_seq,"i":token_index,"m":model_id,"t":text,"ts":millis}`.
//! Every append is `fsync`'d before it returns so a crash immediately after
//! a successful `append` can never lose that line.

use crate::error::PipelineError;
use crate::token::Token;
use fd_lock::RwLock as FdRwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalLine {
    r: String,
    a: u32,
    i: u32,
    m: String,
    t: String,
    ts: i64,
}

impl From<&Token> for WalLine {
    fn from(token: &Token) -> Self {
        Self {
            r: token.request_id.clone(),
            a: token.attempt_seq,
            i: token.token_index,
            m: token.model_id.clone(),
            // Embedded newlines are flattened to spaces here only — the
            // persisted DB copy of `text` keeps them. JSON would escape a
            // literal `\n` into `\\n` anyway, but flattening keeps every WAL
            // line human-`grep`-able on disk.
            t: token.text.replace('\n', " "),
            ts: token.ts.timestamp_millis(),
        }
    }
}

impl WalLine {
    fn into_token(self) -> Token {
        Token {
            request_id: self.r,
            attempt_seq: self.a,
            token_index: self.i,
            model_id: self.m,
            text: self.t,
            ts: chrono::DateTime::from_timestamp_millis(self.ts).unwrap_or_else(chrono::Utc::now),
        }
    }
}

/// A single append-only WAL file, guarded by an advisory lock so a crashed
/// process's stale lock can't wedge a restarted one out.
pub struct WriteAheadLog {
    path: PathBuf,
    max_size_bytes: u64,
}

impl WriteAheadLog {
    pub fn new(path: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        Self { path: path.into(), max_size_bytes }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `tokens` as one line each and fsyncs before returning. An
    /// empty batch is a no-op that still touches the file (creating it if
    /// absent) so callers can rely on `path()` existing afterward.
    pub async fn append(&self, tokens: &[Token]) -> Result<(), PipelineError> {
        let path = self.path.clone();
        let lines: Vec<String> = tokens
            .iter()
            .map(|t| serde_json::to_string(&WalLine::from(t)))
            .collect::<Result<_, _>>()
            .map_err(|e| PipelineError::Fatal { provider: "wal".into(), message: e.to_string() })?;

        tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
            let mut lock = FdRwLock::new(file);
            let mut guard = lock.write().map_err(std::io::Error::from)?;
            for line in &lines {
                writeln!(*guard, "{line}")?;
            }
            guard.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Fatal { provider: "wal".into(), message: e.to_string() })??;

        Ok(())
    }

    /// Reads every currently-stored token, oldest first, skipping (and
    /// logging) any malformed line rather than failing the whole read.
    pub async fn read_all(&self) -> Result<Vec<Token>, PipelineError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Token>, PipelineError> {
            if !path.exists() {
                return Ok(Vec::new());
            }
            let file = File::open(&path)?;
            let reader = BufReader::new(file);
            let mut tokens = Vec::new();
            for line in reader.lines() {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalLine>(trimmed) {
                    Ok(wal_line) => tokens.push(wal_line.into_token()),
                    Err(e) => tracing::warn!(error = %e, "skipping malformed WAL line"),
                }
            }
            Ok(tokens)
        })
        .await
        .map_err(|e| PipelineError::Fatal { provider: "wal".into(), message: e.to_string() })?
    }

    /// Truncates the file to empty. Only ever safe to call after every
    /// currently-stored token has been durably written to the database —
    /// callers must never truncate speculatively.
    pub async fn truncate(&self) -> Result<(), PipelineError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
            if !path.exists() {
                return Ok(());
            }
            let file = OpenOptions::new().write(true).read(true).open(&path)?;
            let mut lock = FdRwLock::new(file);
            let mut guard = lock.write().map_err(std::io::Error::from)?;
            guard.set_len(0)?;
            guard.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Fatal { provider: "wal".into(), message: e.to_string() })?
    }

    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Rotates the current file aside to a `wal-YYYYMMDDHHMM.bak` sibling if
    /// it has grown past `max_size_bytes`, starting a fresh empty file.
    /// Called after a successful truncate, never instead of one.
    pub async fn rotate_if_needed(&self) -> Result<(), PipelineError> {
        if self.size_bytes() <= self.max_size_bytes {
            return Ok(());
        }
        let path = self.path.clone();
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M");
        let rotated = path.with_file_name(format!("wal-{stamp}.bak"));
        tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
            if path.exists() {
                std::fs::rename(&path, &rotated)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Fatal { provider: "wal".into(), message: e.to_string() })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(i: u32) -> Token {
        Token {
            request_id: "r1".into(),
            attempt_seq: 1,
            token_index: i,
            model_id: "gpt-4".into(),
            text: format!("t{i}"),
            ts: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_then_read_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path().join("wal.jsonl"), 1_000_000);
        wal.append(&[token(0), token(1)]).await.unwrap();
        wal.append(&[token(2)]).await.unwrap();
        let tokens = wal.read_all().await.unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].token_index, 0);
        assert_eq!(tokens[2].token_index, 2);
    }

    #[tokio::test]
    async fn read_all_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path().join("missing.jsonl"), 1_000_000);
        assert!(wal.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncate_empties_the_file_without_deleting_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");
        let wal = WriteAheadLog::new(&path, 1_000_000);
        wal.append(&[token(0)]).await.unwrap();
        wal.truncate().await.unwrap();
        assert!(wal.read_all().await.unwrap().is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn skips_malformed_lines_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");
        wal_write_raw(&path, "not json\n{\"r\":\"r1\",\"a\":1,\"i\":0,\"m\":\"gpt-4\",\"t\":\"a\",\"ts\":0}\n");
        let wal = WriteAheadLog::new(&path, 1_000_000);
        let tokens = wal.read_all().await.unwrap();
        assert_eq!(tokens.len(), 1);
    }

    #[tokio::test]
    async fn rotates_when_over_size_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");
        let wal = WriteAheadLog::new(&path, 10);
        wal.append(&[token(0), token(1), token(2)]).await.unwrap();
        wal.rotate_if_needed().await.unwrap();
        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .collect();
        assert_eq!(rotated.len(), 1);
        assert!(wal.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn does_not_rotate_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");
        let wal = WriteAheadLog::new(&path, 1_000_000);
        wal.append(&[token(0)]).await.unwrap();
        wal.rotate_if_needed().await.unwrap();
        assert!(std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()).all(|e| !e.file_name().to_string_lossy().ends_with(".bak")));
    }

    fn wal_write_raw(path: &Path, contents: &str) {
        std::fs::write(path, contents).unwrap();
    }
}
