#![forbid(unsafe_code)]

//! Core token pipeline for a multi-provider LLM comparison service.
//!
//! Streams tokens from whichever provider a request targets, guarding each
//! call with a per-provider circuit breaker and concurrency gate, buffering
//! streamed tokens before handing them to a durable sink, and falling back
//! to a write-ahead log whenever the database can't take a write — so a
//! database outage degrades the pipeline's latency, never its durability.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use llm_arena_core::boot::boot;
//! use llm_arena_core::circuit_breaker::CircuitBreakerRegistry;
//! use llm_arena_core::concurrency_gate::ConcurrencyGateRegistry;
//! use llm_arena_core::fallback::FallbackPolicy;
//! use llm_arena_core::orchestrator::Orchestrator;
//! use llm_arena_core::safe_call::SafeCaller;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let outcome = boot("sqlite:arena.db?mode=rwc", "tokens.wal", 100 * 1024 * 1024, Duration::from_secs(10)).await?;
//!     let safe_caller = Arc::new(SafeCaller::new(CircuitBreakerRegistry::default(), ConcurrencyGateRegistry::default()));
//!     let _orchestrator = Orchestrator::new(safe_caller, outcome.persistence, FallbackPolicy::default(), HashMap::new());
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod boot;
pub mod buffer;
pub mod circuit_breaker;
pub mod clock;
pub mod concurrency_gate;
pub mod config;
pub mod db;
pub mod error;
pub mod fallback;
pub mod orchestrator;
pub mod persistence;
pub mod provider;
pub mod replay;
pub mod safe_call;
pub mod sleeper;
pub mod status;
pub mod timeout;
pub mod token;
pub mod wal;

pub use error::{Outcome, PipelineError};
