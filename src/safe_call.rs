//! Safe call (C4): the per-attempt composition of the circuit breaker
//! (C2), the concurrency gate (C3), and a provider adaptor (C1) into a
//! single retrying, classifying call.

use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::concurrency_gate::ConcurrencyGateRegistry;
use crate::error::PipelineError;
use crate::provider::{classify, CallContext, ClassifiedFailure, ProviderAdaptor};
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::{future::BoxFuture, StreamExt};
use std::sync::Arc;

const MAX_TRIES: u32 = 3;

pub struct SafeCaller {
    breakers: CircuitBreakerRegistry,
    gates: ConcurrencyGateRegistry,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl SafeCaller {
    pub fn new(breakers: CircuitBreakerRegistry, gates: ConcurrencyGateRegistry) -> Self {
        Self { breakers, gates, backoff: Backoff::safe_call_default(), sleeper: Arc::new(TokioSleeper) }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Streams every token produced by `provider` for `model`/`prompt`,
    /// awaiting `on_token` for each one as it arrives — `on_token` is where
    /// a caller buffers the token (and can thus back-pressure the stream by
    /// not resolving until the buffer admits it). Returns once the stream
    /// ends successfully or every retry is exhausted.
    pub async fn call<'a, F>(
        &self,
        provider: &Arc<dyn ProviderAdaptor>,
        model: &str,
        prompt: &str,
        ctx: &CallContext,
        mut on_token: F,
    ) -> Result<(), PipelineError>
    where
        F: FnMut(String) -> BoxFuture<'a, Result<(), PipelineError>>,
    {
        let provider_name = provider.provider_name().to_string();
        let breaker = self.breakers.get(&provider_name);
        let gate = self.gates.get(&provider_name);

        breaker.gate(&provider_name)?;
        let _permit = gate.acquire().await;

        for attempt in 1..=MAX_TRIES {
            let stream_result = provider.stream_raw(model, prompt, ctx).await;
            let mut stream = match stream_result {
                Ok(stream) => stream,
                Err(raw_err) => {
                    if let Some(outcome) = self.handle_failure(&breaker, &provider_name, &raw_err, attempt).await? {
                        return Err(outcome);
                    }
                    continue;
                }
            };

            let mut failure = None;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(text) => on_token(text).await?,
                    Err(raw_err) => {
                        failure = Some(raw_err);
                        break;
                    }
                }
            }

            match failure {
                None => {
                    breaker.record_success();
                    return Ok(());
                }
                Some(raw_err) => {
                    if let Some(outcome) = self.handle_failure(&breaker, &provider_name, &raw_err, attempt).await? {
                        return Err(outcome);
                    }
                }
            }
        }

        Err(PipelineError::GenerationExhausted { model: model.to_string() })
    }

    /// Classifies `raw_err`, records it against the breaker, and either
    /// sleeps for a retry (returning `Ok(None)`) or returns the terminal
    /// error for this call (`Ok(Some(err))`).
    async fn handle_failure(
        &self,
        breaker: &crate::circuit_breaker::CircuitBreaker,
        provider_name: &str,
        raw_err: &crate::provider::RawProviderError,
        attempt: u32,
    ) -> Result<Option<PipelineError>, PipelineError> {
        match classify(raw_err) {
            ClassifiedFailure::Fatal => {
                Ok(Some(PipelineError::Fatal { provider: provider_name.to_string(), message: raw_err.message.clone() }))
            }
            ClassifiedFailure::ProviderDown => {
                breaker.record_failure(true);
                Ok(Some(PipelineError::ProviderDown { provider: provider_name.to_string() }))
            }
            ClassifiedFailure::RateLimit | ClassifiedFailure::Timeout => {
                breaker.record_failure(true);
                if attempt >= MAX_TRIES {
                    return Ok(None); // caller's loop ends naturally, GenerationExhausted returned after loop
                }
                self.sleeper.sleep(self.backoff.delay(attempt as usize)).await;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{RawProviderError, ScriptedProvider, ScriptedRun};
    use std::sync::Mutex;

    fn caller() -> SafeCaller {
        SafeCaller::new(CircuitBreakerRegistry::default(), ConcurrencyGateRegistry::default())
    }

    #[tokio::test]
    async fn retries_sleep_for_the_configured_backoff_delays() {
        use crate::sleeper::TrackingSleeper;
        let tracker = Arc::new(TrackingSleeper::new());
        let caller = caller().with_sleeper(tracker.clone());
        let provider: Arc<dyn ProviderAdaptor> = Arc::new(ScriptedProvider::new(
            "openai-track",
            vec![
                ScriptedRun::ImmediateError(RawProviderError::status(429, "slow down")),
                ScriptedRun::ImmediateError(RawProviderError::timeout("slow")),
                ScriptedRun::Chunks(vec!["a".into()]),
            ],
        ));
        let ctx = CallContext::new();
        caller.call(&provider, "gpt-4", "hi", &ctx, collecting_sink(Arc::new(Mutex::new(vec![])))).await.unwrap();
        assert_eq!(tracker.calls(), 2);
        assert_eq!(tracker.call_at(0).unwrap(), std::time::Duration::from_millis(1500));
        assert_eq!(tracker.call_at(1).unwrap(), std::time::Duration::from_millis(2250));
    }

    /// Wraps a plain `Vec` collector into the `FnMut(String) -> BoxFuture`
    /// shape `SafeCaller::call` expects, for tests that don't need to
    /// exercise real async back-pressure.
    fn collecting_sink(out: Arc<Mutex<Vec<String>>>) -> impl FnMut(String) -> futures::future::BoxFuture<'static, Result<(), PipelineError>> {
        move |text| {
            out.lock().unwrap().push(text);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn happy_path_yields_every_chunk() {
        let caller = caller();
        let provider: Arc<dyn ProviderAdaptor> =
            Arc::new(ScriptedProvider::new("openai-happy", vec![ScriptedRun::Chunks(vec!["a".into(), "b".into()])]));
        let ctx = CallContext::new();
        let collected = Arc::new(Mutex::new(vec![]));
        caller.call(&provider, "gpt-4", "hi", &ctx, collecting_sink(collected.clone())).await.unwrap();
        assert_eq!(*collected.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_then_success_retries_and_succeeds() {
        let caller = caller();
        let provider: Arc<dyn ProviderAdaptor> = Arc::new(ScriptedProvider::new(
            "openai-retry",
            vec![
                ScriptedRun::ImmediateError(RawProviderError::status(429, "slow down")),
                ScriptedRun::Chunks(vec!["a".into()]),
            ],
        ));
        let ctx = CallContext::new();
        let collected = Arc::new(Mutex::new(vec![]));
        caller.call(&provider, "gpt-4", "hi", &ctx, collecting_sink(collected.clone())).await.unwrap();
        assert_eq!(*collected.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn fatal_fails_immediately_without_retry() {
        let caller = caller();
        let provider: Arc<dyn ProviderAdaptor> = Arc::new(ScriptedProvider::new(
            "openai-fatal",
            vec![ScriptedRun::ImmediateError(RawProviderError::status(400, "bad request"))],
        ));
        let ctx = CallContext::new();
        let result = caller.call(&provider, "gpt-4", "hi", &ctx, collecting_sink(Arc::new(Mutex::new(vec![])))).await;
        assert!(matches!(result, Err(PipelineError::Fatal { .. })));
    }

    #[tokio::test]
    async fn provider_down_fails_without_retry_within_this_call() {
        let caller = caller();
        let provider: Arc<dyn ProviderAdaptor> = Arc::new(ScriptedProvider::new(
            "openai-down",
            vec![ScriptedRun::ImmediateError(RawProviderError::status(503, "down"))],
        ));
        let ctx = CallContext::new();
        let result = caller.call(&provider, "gpt-4", "hi", &ctx, collecting_sink(Arc::new(Mutex::new(vec![])))).await;
        assert!(matches!(result, Err(PipelineError::ProviderDown { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_all_tries_on_rate_limit_returns_generation_exhausted() {
        let caller = caller();
        let provider: Arc<dyn ProviderAdaptor> = Arc::new(ScriptedProvider::new(
            "openai-exhaust",
            vec![
                ScriptedRun::ImmediateError(RawProviderError::status(429, "slow down")),
                ScriptedRun::ImmediateError(RawProviderError::status(429, "slow down")),
                ScriptedRun::ImmediateError(RawProviderError::status(429, "slow down")),
            ],
        ));
        let ctx = CallContext::new();
        let result = caller.call(&provider, "gpt-4", "hi", &ctx, collecting_sink(Arc::new(Mutex::new(vec![])))).await;
        assert!(matches!(result, Err(PipelineError::GenerationExhausted { .. })));
    }
}
