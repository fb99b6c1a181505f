//! Pipeline orchestrator (C12): drives one streaming attempt end to end,
//! owning the fallback decision and the no-token-loss invariant across
//! buffer, persistence, and cancellation.

use crate::buffer::{Buffer, BufferRegistry};
use crate::error::{Outcome, PipelineError};
use crate::fallback::FallbackPolicy;
use crate::persistence::PersistenceService;
use crate::provider::{CallContext, ProviderAdaptor};
use crate::safe_call::SafeCaller;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::token::{Attempt, AttemptStatus, ModelChoice, Request, RequestStatus, Token, TokenBuilder};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DRAIN_ON_CANCEL_DEADLINE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    safe_caller: Arc<SafeCaller>,
    persistence: Arc<PersistenceService>,
    fallback: FallbackPolicy,
    providers: HashMap<String, Arc<dyn ProviderAdaptor>>,
    sleeper: Arc<dyn Sleeper>,
    buffer_registry: BufferRegistry,
}

impl Orchestrator {
    pub fn new(
        safe_caller: Arc<SafeCaller>,
        persistence: Arc<PersistenceService>,
        fallback: FallbackPolicy,
        providers: HashMap<String, Arc<dyn ProviderAdaptor>>,
    ) -> Self {
        Self {
            safe_caller,
            persistence,
            fallback,
            providers,
            sleeper: Arc::new(TokioSleeper),
            buffer_registry: BufferRegistry::new(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Exposes the live-buffer registry so the status surface (ambient) can
    /// read per-attempt lengths, oldest-token age, and last flush duration.
    pub fn buffer_registry(&self) -> BufferRegistry {
        self.buffer_registry.clone()
    }

    /// Drives the request's first attempt, recursing through fallback
    /// models until one succeeds, every model is exhausted, or a `Fatal`
    /// error ends the request outright. `on_token` receives every token
    /// from every attempt in order, including fallback attempts.
    pub async fn run_request<F>(
        &self,
        request_id: &str,
        prompt: &str,
        first_model: ModelChoice,
        ctx: &CallContext,
        mut on_token: F,
    ) -> Outcome
    where
        F: FnMut(&Token) + Send,
    {
        let request = Request {
            request_id: request_id.to_string(),
            prompt: prompt.to_string(),
            models: vec![first_model.clone()],
            status: RequestStatus::InProgress,
            created_at: Utc::now(),
        };
        let _ = self.persistence.database().upsert_request(&request).await;

        let mut model = first_model;
        let mut already_tried = Vec::new();
        let mut attempt_seq: u32 = 1;

        let outcome = loop {
            already_tried.push(model.model.clone());
            let attempt_result = self.run_attempt(request_id, attempt_seq, prompt, &model, ctx, &mut on_token).await;

            match attempt_result {
                Ok(()) => break Outcome::Ok,
                Err(PipelineError::Cancelled) => break Outcome::Cancelled,
                Err(PipelineError::PersistenceFatal(_)) => break Outcome::PersistenceFailed,
                Err(PipelineError::Fatal { .. }) => break Outcome::Fatal,
                Err(err @ (PipelineError::ProviderDown { .. } | PipelineError::GenerationExhausted { .. })) => {
                    let _ = err;
                    match self.fallback.next(&already_tried) {
                        Some(next) => {
                            let jitter = self.fallback.jitter();
                            tokio::select! {
                                _ = self.sleeper.sleep(jitter) => {}
                                _ = ctx.cancelled() => break Outcome::Cancelled,
                            }
                            model = next.clone();
                            attempt_seq += 1;
                            continue;
                        }
                        None => break Outcome::ProviderDown,
                    }
                }
                Err(_) => break Outcome::Fatal,
            }
        };

        let finished = Request {
            status: if outcome == Outcome::Ok { RequestStatus::Completed } else { RequestStatus::Failed },
            ..request
        };
        let _ = self.persistence.database().upsert_request(&finished).await;

        outcome
    }

    async fn run_attempt<F>(
        &self,
        request_id: &str,
        attempt_seq: u32,
        prompt: &str,
        model: &ModelChoice,
        ctx: &CallContext,
        on_token: &mut F,
    ) -> Result<(), PipelineError>
    where
        F: FnMut(&Token) + Send,
    {
        let provider = self
            .providers
            .get(&model.provider)
            .cloned()
            .ok_or_else(|| PipelineError::Config(format!("no adaptor registered for provider {}", model.provider)))?;

        let attempt_key = format!("{request_id}:{attempt_seq}");
        let mut builder = TokenBuilder::new(request_id, attempt_seq, &model.model);
        let buffer = Buffer::new(attempt_key.clone(), self.persistence.clone());
        self.buffer_registry.register(buffer.clone()).await;

        let started_at = Utc::now();
        let mut attempt = Attempt {
            request_id: request_id.to_string(),
            attempt_seq,
            model_id: model.model.clone(),
            provider: model.provider.clone(),
            status: AttemptStatus::Streaming,
            started_at,
            ended_at: None,
            error_kind: None,
        };
        let _ = self.persistence.database().upsert_attempt(&attempt).await;

        let call_result = self
            .safe_caller
            .call(&provider, &model.model, prompt, ctx, |raw| {
                let token = builder.build(raw);
                let buffer = buffer.clone();
                let inner_ctx = ctx.clone();
                // Reborrowed fresh on every chunk: each call's future is
                // fully awaited (and dropped) before `SafeCaller::call`
                // produces the next one, so these borrows never overlap.
                let emit = &mut *on_token;
                Box::pin(async move {
                    let for_client = token.clone();
                    // The client must never observe a token that wasn't
                    // durably buffered first — no-token-loss (C12) depends
                    // on this ordering.
                    buffer.add(token, &inner_ctx).await?;
                    emit(&for_client);
                    Ok(())
                })
            })
            .await;

        let final_result = match &call_result {
            Ok(()) => {
                if ctx.is_cancelled() {
                    Err(PipelineError::Cancelled)
                } else {
                    buffer.drain_all().await
                }
            }
            Err(PipelineError::Cancelled) => {
                let _ = tokio::time::timeout(DRAIN_ON_CANCEL_DEADLINE, buffer.drain_all()).await;
                Err(PipelineError::Cancelled)
            }
            Err(_) => {
                let _ = tokio::time::timeout(DRAIN_ON_CANCEL_DEADLINE, buffer.drain_all()).await;
                call_result
            }
        };

        attempt.ended_at = Some(Utc::now());
        attempt.status = match &final_result {
            Ok(()) => AttemptStatus::Completed,
            Err(_) => AttemptStatus::Failed,
        };
        attempt.error_kind = final_result.as_ref().err().map(|e| Outcome::from_error(e).as_str().to_string());
        let _ = self.persistence.database().upsert_attempt(&attempt).await;

        // Deregistered only now, after drain_all has had its chance to run —
        // the status surface should still see this buffer while a cancel or
        // error path is still draining it above.
        self.buffer_registry.deregister(&attempt_key).await;

        final_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::concurrency_gate::ConcurrencyGateRegistry;
    use crate::db::Database;
    use crate::provider::{RawProviderError, ScriptedProvider, ScriptedRun};
    use crate::wal::WriteAheadLog;

    async fn harness() -> (Orchestrator, tempfile::TempDir) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WriteAheadLog::new(dir.path().join("wal.jsonl"), 1_000_000));
        let persistence = Arc::new(PersistenceService::new(db, wal));
        let safe_caller = Arc::new(SafeCaller::new(CircuitBreakerRegistry::default(), ConcurrencyGateRegistry::default()));
        (Orchestrator::new(safe_caller, persistence, FallbackPolicy::default(), HashMap::new()), dir)
    }

    fn with_provider(orchestrator: Orchestrator, provider: Arc<dyn ProviderAdaptor>) -> Orchestrator {
        let mut providers = orchestrator.providers;
        providers.insert(provider.provider_name().to_string(), provider);
        Orchestrator { providers, ..orchestrator }
    }

    #[tokio::test]
    async fn happy_path_completes_without_fallback() {
        let (orchestrator, _dir) = harness().await;
        let provider: Arc<dyn ProviderAdaptor> =
            Arc::new(ScriptedProvider::new("openai", vec![ScriptedRun::Chunks(vec!["a".into(), "b".into()])]));
        let orchestrator = with_provider(orchestrator, provider);
        let ctx = CallContext::new();
        let mut collected = vec![];
        let outcome = orchestrator
            .run_request(
                "r1",
                "hi",
                ModelChoice { provider: "openai".into(), model: "gpt-4".into() },
                &ctx,
                |t| collected.push(t.text.clone()),
            )
            .await;
        assert_eq!(outcome, Outcome::Ok);
        assert_eq!(collected, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_down_falls_back_to_the_next_model() {
        let (orchestrator, _dir) = harness().await;
        let failing: Arc<dyn ProviderAdaptor> = Arc::new(ScriptedProvider::new(
            "openai",
            vec![ScriptedRun::ImmediateError(RawProviderError::status(503, "down"))],
        ));
        let fallback_provider: Arc<dyn ProviderAdaptor> =
            Arc::new(ScriptedProvider::new("anthropic", vec![ScriptedRun::Chunks(vec!["ok".into()])]));
        let orchestrator = with_provider(orchestrator, failing);
        let orchestrator = with_provider(orchestrator, fallback_provider);
        let ctx = CallContext::new();
        let mut collected = vec![];
        let outcome = orchestrator
            .run_request(
                "r1",
                "hi",
                ModelChoice { provider: "openai".into(), model: "gpt-3.5-turbo".into() },
                &ctx,
                |t| collected.push(t.text.clone()),
            )
            .await;
        assert_eq!(outcome, Outcome::Ok);
        assert_eq!(collected, vec!["ok"]);
    }

    #[tokio::test]
    async fn fatal_error_ends_the_request_without_fallback() {
        let (orchestrator, _dir) = harness().await;
        let provider: Arc<dyn ProviderAdaptor> = Arc::new(ScriptedProvider::new(
            "openai",
            vec![ScriptedRun::ImmediateError(RawProviderError::status(400, "bad"))],
        ));
        let orchestrator = with_provider(orchestrator, provider);
        let ctx = CallContext::new();
        let outcome = orchestrator
            .run_request("r1", "hi", ModelChoice { provider: "openai".into(), model: "gpt-4".into() }, &ctx, |_| {})
            .await;
        assert_eq!(outcome, Outcome::Fatal);
    }
}
