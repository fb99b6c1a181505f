//! Data model (§3): `Token`, `Attempt`, `Request`, and the per-attempt
//! token builder (C5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single streamed chunk, uniquely identified by
/// `(request_id, attempt_seq, token_index)` once persisted. Never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub request_id: String,
    pub attempt_seq: u32,
    pub token_index: u32,
    pub model_id: String,
    pub text: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub request_id: String,
    pub attempt_seq: u32,
    pub model_id: String,
    pub provider: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelChoice {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub prompt: String,
    pub models: Vec<ModelChoice>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

/// Per-attempt, purely sequential token counter (C5). Never blocks, does no
/// I/O; `build` is the only place a `token_index` is ever assigned.
pub struct TokenBuilder {
    request_id: String,
    attempt_seq: u32,
    model_id: String,
    next_index: u32,
}

impl TokenBuilder {
    pub fn new(request_id: impl Into<String>, attempt_seq: u32, model_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), attempt_seq, model_id: model_id.into(), next_index: 0 }
    }

    pub fn build(&mut self, raw: String) -> Token {
        let token = Token {
            request_id: self.request_id.clone(),
            attempt_seq: self.attempt_seq,
            token_index: self.next_index,
            model_id: self.model_id.clone(),
            text: raw,
            ts: Utc::now(),
        };
        self.next_index += 1;
        token
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }
}
