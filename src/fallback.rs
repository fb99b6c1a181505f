//! Fallback policy (C11): the fixed, ordered list of alternate models the
//! orchestrator falls back to on `ProviderDown` / `GenerationExhausted`.

use crate::token::ModelChoice;
use rand::Rng;
use std::time::Duration;

pub const JITTER_MIN: Duration = Duration::from_secs(1);
pub const JITTER_MAX: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    ordered: Vec<ModelChoice>,
}

impl FallbackPolicy {
    pub fn new(ordered: Vec<ModelChoice>) -> Self {
        Self { ordered }
    }

    /// The first listed model not already present in `already_tried`
    /// (matched by model id).
    pub fn next(&self, already_tried: &[String]) -> Option<&ModelChoice> {
        self.ordered.iter().find(|choice| !already_tried.iter().any(|tried| tried == &choice.model))
    }

    /// A uniform `[1s, 3s]` delay to wait before re-entering the
    /// orchestrator with the fallback model.
    pub fn jitter(&self) -> Duration {
        let millis = rand::rng().random_range(JITTER_MIN.as_millis() as u64..=JITTER_MAX.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::new(vec![
            ModelChoice { provider: "openai".into(), model: "gpt-3.5-turbo".into() },
            ModelChoice { provider: "anthropic".into(), model: "claude-haiku".into() },
            ModelChoice { provider: "google".into(), model: "gemini-flash".into() },
            ModelChoice { provider: "deepseek".into(), model: "deepseek-chat".into() },
        ])
    }
}
