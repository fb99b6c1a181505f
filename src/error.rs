//! Error types shared across the token pipeline.

use std::time::Duration;
use thiserror::Error;

/// The single error currency at every module boundary named in the spec.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A specific provider is unavailable; the orchestrator may fall back.
    #[error("provider {provider} is down")]
    ProviderDown { provider: String },

    /// Retryable within the safe-call loop (C4); never escapes it directly.
    #[error("rate limited by {provider}")]
    RateLimit { provider: String },

    /// Retryable within the safe-call loop (C4); never escapes it directly.
    #[error("timed out calling {provider} after {elapsed:?}")]
    Timeout { provider: String, elapsed: Duration },

    /// Non-retryable, surfaced to the caller, never triggers fallback.
    #[error("fatal error from {provider}: {message}")]
    Fatal { provider: String, message: String },

    /// The safe-call retry budget (3 tries) was exhausted on qualifying
    /// failures without a fatal error ever being seen.
    #[error("generation exhausted after retries against {model}")]
    GenerationExhausted { model: String },

    /// A batch was redirected to the WAL; treated as success on the
    /// streaming path, but distinguished here for status/logging purposes.
    #[error("batch persisted to write-ahead log instead of the database")]
    PersistenceDeferred,

    /// Both the database and the WAL failed; the attempt cannot continue.
    #[error("persistence failed: database and write-ahead log both unavailable")]
    PersistenceFatal(#[source] Box<PipelineError>),

    /// Caller-initiated or shutdown-initiated cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// A malformed or missing required environment variable at boot.
    #[error("configuration error: {0}")]
    Config(String),

    /// A database error that didn't cleanly classify into one of C8's four
    /// outcomes, or a migration failure at boot.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// WAL file operations that aren't durability failures per se.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn is_provider_down(&self) -> bool {
        matches!(self, Self::ProviderDown { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_generation_exhausted(&self) -> bool {
        matches!(self, Self::GenerationExhausted { .. })
    }
}

/// Terminal status marker attached to the end of a streamed attempt and
/// recorded on the persisted `Attempt` row's `error_kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    ProviderDown,
    Exhausted,
    Fatal,
    Cancelled,
    PersistenceFailed,
}

impl Outcome {
    pub fn from_error(err: &PipelineError) -> Self {
        match err {
            PipelineError::ProviderDown { .. } => Outcome::ProviderDown,
            PipelineError::GenerationExhausted { .. } => Outcome::Exhausted,
            PipelineError::Fatal { .. } => Outcome::Fatal,
            PipelineError::Cancelled => Outcome::Cancelled,
            PipelineError::PersistenceFatal(_) => Outcome::PersistenceFailed,
            _ => Outcome::Fatal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::ProviderDown => "provider_down",
            Outcome::Exhausted => "exhausted",
            Outcome::Fatal => "fatal",
            Outcome::Cancelled => "cancelled",
            Outcome::PersistenceFailed => "persistence_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_from_provider_down() {
        let err = PipelineError::ProviderDown { provider: "openai".into() };
        assert_eq!(Outcome::from_error(&err), Outcome::ProviderDown);
    }

    #[test]
    fn outcome_from_fatal() {
        let err = PipelineError::Fatal { provider: "openai".into(), message: "bad request".into() };
        assert_eq!(Outcome::from_error(&err), Outcome::Fatal);
        assert!(err.is_fatal());
    }

    #[test]
    fn outcome_as_str_matches_spec_markers() {
        assert_eq!(Outcome::Ok.as_str(), "ok");
        assert_eq!(Outcome::ProviderDown.as_str(), "provider_down");
        assert_eq!(Outcome::Exhausted.as_str(), "exhausted");
        assert_eq!(Outcome::Fatal.as_str(), "fatal");
        assert_eq!(Outcome::Cancelled.as_str(), "cancelled");
        assert_eq!(Outcome::PersistenceFailed.as_str(), "persistence_failed");
    }
}
