use llm_arena_core::circuit_breaker::CircuitBreakerRegistry;
use llm_arena_core::concurrency_gate::ConcurrencyGateRegistry;
use llm_arena_core::db::Database;
use llm_arena_core::fallback::FallbackPolicy;
use llm_arena_core::orchestrator::Orchestrator;
use llm_arena_core::persistence::PersistenceService;
use llm_arena_core::provider::{CallContext, ProviderAdaptor, RawProviderError, ScriptedProvider, ScriptedRun};
use llm_arena_core::safe_call::SafeCaller;
use llm_arena_core::token::ModelChoice;
use llm_arena_core::Outcome;
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn a_down_provider_falls_back_to_the_next_model_and_completes_there() {
    let db = Arc::new(Database::in_memory().await.unwrap());
    let dir = tempfile::tempdir().unwrap();
    let wal = Arc::new(llm_arena_core::wal::WriteAheadLog::new(dir.path().join("wal.jsonl"), 1_000_000));
    let persistence = Arc::new(PersistenceService::new(db.clone(), wal));

    let openai: Arc<dyn ProviderAdaptor> = Arc::new(ScriptedProvider::new(
        "openai",
        vec![ScriptedRun::ImmediateError(RawProviderError::status(503, "down"))],
    ));
    let anthropic: Arc<dyn ProviderAdaptor> =
        Arc::new(ScriptedProvider::new("anthropic", vec![ScriptedRun::Chunks(vec!["hi".into(), " there".into()])]));
    let mut providers = HashMap::new();
    providers.insert("openai".to_string(), openai);
    providers.insert("anthropic".to_string(), anthropic);

    let safe_caller = Arc::new(SafeCaller::new(CircuitBreakerRegistry::default(), ConcurrencyGateRegistry::default()));
    let orchestrator = Orchestrator::new(safe_caller, persistence, FallbackPolicy::default(), providers);

    let ctx = CallContext::new();
    let mut models_seen = vec![];
    let outcome = orchestrator
        .run_request(
            "req-3",
            "hi",
            ModelChoice { provider: "openai".into(), model: "gpt-3.5-turbo".into() },
            &ctx,
            |token| models_seen.push(token.model_id.clone()),
        )
        .await;

    assert_eq!(outcome, Outcome::Ok);
    assert_eq!(models_seen, vec!["claude-haiku", "claude-haiku"]);

    let gaps = llm_arena_core::boot::detect_token_gaps(&db, 10).await.unwrap();
    assert!(gaps.is_empty());
    assert_eq!(db.attempts_total().await.unwrap(), 2);
}
