//! Provider adaptor boundary (C1): the trait each concrete LLM transport
//! implements, plus the pure classification function that maps a raw
//! transport failure to one of the categories the rest of the pipeline
//! reasons about.

use futures::stream::BoxStream;

/// A raw transport-level failure, as a concrete provider adaptor would
/// report it, before classification.
#[derive(Debug, Clone)]
pub struct RawProviderError {
    pub status: Option<u16>,
    pub transport_timeout: bool,
    pub connection_reset: bool,
    pub message: String,
}

impl RawProviderError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), transport_timeout: false, connection_reset: false, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { status: None, transport_timeout: true, connection_reset: false, message: message.into() }
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self { status: None, transport_timeout: false, connection_reset: true, message: message.into() }
    }
}

/// The deterministic classification of a raw transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifiedFailure {
    RateLimit,
    Timeout,
    ProviderDown,
    Fatal,
}

impl ClassifiedFailure {
    /// Only `RateLimit | Timeout | ProviderDown` count toward tripping the
    /// circuit breaker (C2); `Fatal` is a user/request-side problem.
    pub fn is_qualifying(&self) -> bool {
        !matches!(self, ClassifiedFailure::Fatal)
    }
}

/// Deterministic by HTTP status (and transport signal) alone — see
/// SPEC_FULL.md's C1 module for the exact table this implements.
pub fn classify(err: &RawProviderError) -> ClassifiedFailure {
    if err.transport_timeout {
        return ClassifiedFailure::Timeout;
    }
    if err.connection_reset {
        return ClassifiedFailure::ProviderDown;
    }
    match err.status {
        Some(429) => ClassifiedFailure::RateLimit,
        Some(408) | Some(504) => ClassifiedFailure::Timeout,
        Some(400) | Some(401) | Some(403) | Some(404) | Some(422) => ClassifiedFailure::Fatal,
        Some(status) if (500..600).contains(&status) => ClassifiedFailure::ProviderDown,
        _ => ClassifiedFailure::Fatal,
    }
}

/// Arbitrary per-call context: a cancellation token and anything a
/// concrete adaptor needs to thread through (API keys, timeouts, etc. live
/// on the adaptor itself, not here).
#[derive(Clone)]
pub struct CallContext {
    cancel: tokio_util_cancel::CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self { cancel: tokio_util_cancel::CancellationToken::new() }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn child(&self) -> Self {
        Self { cancel: self.cancel.clone() }
    }

    /// Resolves once `cancel()` has been called. Used to race against a
    /// blocking wait (e.g. C6's back-pressured `add`) so cancellation
    /// interrupts it promptly instead of polling.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The boundary every concrete provider transport implements. A stream is
/// single-shot: once it errors, the caller opens a fresh one via a new
/// `stream_raw` call rather than resuming this one.
#[async_trait::async_trait]
pub trait ProviderAdaptor: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn stream_raw(
        &self,
        model: &str,
        prompt: &str,
        ctx: &CallContext,
    ) -> Result<BoxStream<'static, Result<String, RawProviderError>>, RawProviderError>;
}

/// A scripted in-memory provider used throughout the test suite in place of
/// a real network call. Each call to `stream_raw` consumes the next script
/// entry; scripts are consumed in order and panic if exhausted, which keeps
/// tests honest about exactly how many tries they expect.
pub struct ScriptedProvider {
    name: String,
    scripts: std::sync::Mutex<std::collections::VecDeque<ScriptedRun>>,
}

pub enum ScriptedRun {
    /// Yields every chunk then ends the stream successfully.
    Chunks(Vec<String>),
    /// Yields the given chunks, then the stream ends with this error.
    ChunksThenError(Vec<String>, RawProviderError),
    /// Fails immediately, before yielding any chunk.
    ImmediateError(RawProviderError),
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, scripts: Vec<ScriptedRun>) -> Self {
        Self { name: name.into(), scripts: std::sync::Mutex::new(scripts.into()) }
    }
}

#[async_trait::async_trait]
impl ProviderAdaptor for ScriptedProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn stream_raw(
        &self,
        _model: &str,
        _prompt: &str,
        _ctx: &CallContext,
    ) -> Result<BoxStream<'static, Result<String, RawProviderError>>, RawProviderError> {
        let run = self
            .scripts
            .lock()
            .expect("ScriptedProvider mutex poisoned")
            .pop_front()
            .expect("ScriptedProvider script exhausted: test made more tries than scripted");

        match run {
            ScriptedRun::ImmediateError(err) => Err(err),
            ScriptedRun::Chunks(chunks) => {
                Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
            }
            ScriptedRun::ChunksThenError(chunks, err) => {
                let items: Vec<Result<String, RawProviderError>> =
                    chunks.into_iter().map(Ok).chain(std::iter::once(Err(err))).collect();
                Ok(Box::pin(futures::stream::iter(items)))
            }
        }
    }
}

/// Minimal cancellation token, grounded on the same "cheap `Arc<Atomic>`
/// cooperative flag" idiom the teacher uses for its own lock-free state
/// (see `circuit_breaker.rs`), rather than pulling in `tokio-util` for a
/// single primitive.
mod tokio_util_cancel {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    pub struct CancellationToken {
        flag: Arc<AtomicBool>,
        notify: Arc<Notify>,
    }

    impl CancellationToken {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.flag.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        pub fn is_cancelled(&self) -> bool {
            self.flag.load(Ordering::SeqCst)
        }

        pub async fn cancelled(&self) {
            // Register for notification before checking the flag so a
            // `cancel()` landing between the check and the await can't be
            // missed (Notify only wakes tasks already registered).
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
