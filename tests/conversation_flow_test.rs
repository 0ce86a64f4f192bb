//! 对话流程集成测试：需求收集 → 计划生成 → 导出

use std::sync::Arc;

use planloom::config::AppConfig;
use planloom::core::{ConversationState, LlmError};
use planloom::llm::{MockProvider, ProviderRegistry};
use planloom::memory::{ConversationStore, InMemoryStore};
use planloom::plan::{analyze_plan, check_invariants, from_json, phase_range, to_json, PhaseStatus};
use planloom::EngineBuilder;

const PLAN_JSON: &str = r#"Here is the plan:
```json
{"title": "Todo App", "description": "A todo app with login", "phases": [
  {"title": "Project setup", "description": "Scaffold the repository", "complexity": "low",
   "tasks": [{"title": "Init", "goal": "Create the project skeleton"}]},
  {"title": "Authentication", "description": "Login and sessions", "dependencies": [1],
   "tasks": [{"title": "Login form", "goal": "Users can log in", "acceptanceCriteria": ["valid credentials succeed"]}]},
  {"title": "Todo CRUD", "description": "Create, list, complete todos", "dependencies": ["phase-002"]},
  {"title": "Polish", "description": "Styling and release", "dependencies": ["phase-003"]}
]}
```"#;

fn scripted_provider() -> MockProvider {
    MockProvider::from_fn("mock", |req| {
        let first = req.messages.first().map(|m| m.content.as_str()).unwrap_or("");
        if first.starts_with("Summarize the software requirements") {
            Ok("Build a todo app with user login.".to_string())
        } else if first.starts_with("You are a technical project planner") {
            Ok(PLAN_JSON.to_string())
        } else {
            Ok("Got it. Anything else?".to_string())
        }
    })
}

fn engine_with(provider: MockProvider, store: Arc<InMemoryStore>) -> planloom::Engine {
    let mut registry = ProviderRegistry::new().with_priority(["mock"]);
    registry.register(Arc::new(provider));
    let mut config = AppConfig::default();
    config.retry.max_retries = 0;
    config.persistence.debounce_ms = 60_000;
    EngineBuilder::new(config)
        .with_registry(registry)
        .with_store(store)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_todo_app_conversation_produces_valid_plan() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_with(scripted_provider(), store.clone());
    let conversations = engine.conversations.clone();
    let id = conversations.create_conversation(None).await;

    let first = conversations
        .send_message(&id, "I want a todo app with login", None)
        .await
        .unwrap();
    assert_eq!(first.state, ConversationState::GatheringRequirements);
    assert_eq!(first.reply, "Got it. Anything else?");

    let second = conversations.send_message(&id, "ready for plan", None).await.unwrap();
    assert_eq!(second.state, ConversationState::Complete);
    assert!(second.plan_generated);

    let plan = conversations.plan(&id).await.unwrap();
    let range = phase_range("Build a todo app with user login.");
    assert!(range.contains(plan.phases.len()));
    assert!((3..=10).contains(&plan.total_phases));
    assert!(check_invariants(&plan).is_empty());
    assert!(plan.phases.iter().all(|p| p.status == PhaseStatus::Pending));
    assert_eq!(plan.phases[1].dependencies, vec!["phase-001"]);

    let analysis = analyze_plan(&plan);
    assert!(!analysis.has_cycles());
    assert_eq!(analysis.critical_path.len(), 4);

    let restored = from_json(&to_json(&plan).unwrap()).unwrap();
    assert_eq!(restored, plan);

    conversations.flush().await.unwrap();
    let saved = store.load_conversation(&id).await.unwrap();
    assert_eq!(saved.state, ConversationState::Complete);
    assert_eq!(saved.phase_count, Some(4));
    assert!(store.load_plan(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_first_turn_never_generates_plan() {
    let engine = engine_with(scripted_provider(), Arc::new(InMemoryStore::new()));
    let id = engine.conversations.create_conversation(Some("Quick")).await;
    let turn = engine
        .conversations
        .send_message(&id, "ready for plan: a todo app", None)
        .await
        .unwrap();
    assert_eq!(turn.state, ConversationState::GatheringRequirements);
    assert!(!turn.plan_generated);
}

#[tokio::test]
async fn test_provider_failure_keeps_conversation_usable() {
    let provider = MockProvider::from_fn("mock", |_| {
        Err(LlmError::Network("connection refused".into()))
    });
    let engine = engine_with(provider, Arc::new(InMemoryStore::new()));
    let id = engine.conversations.create_conversation(None).await;
    assert!(engine.conversations.send_message(&id, "hello", None).await.is_err());

    let conv = engine.conversations.conversation(&id).await.unwrap();
    assert_eq!(conv.state, ConversationState::Idle);
    assert_eq!(conv.user_turns(), 0);
}

#[tokio::test]
async fn test_cancelled_planning_keeps_history_and_reverts_state() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut registry = ProviderRegistry::new().with_priority(["mock"]);
    registry.register(Arc::new(scripted_provider()));
    let mut config = AppConfig::default();
    config.retry.max_retries = 0;
    let engine = EngineBuilder::new(config)
        .with_registry(registry)
        .with_store(Arc::new(InMemoryStore::new()))
        .with_events(tx)
        .build()
        .unwrap();
    let conversations = engine.conversations.clone();
    let id = conversations.create_conversation(None).await;
    conversations
        .send_message(&id, "I want a todo app with login", None)
        .await
        .unwrap();
    let contents = |messages: &[planloom::memory::Message]| {
        messages.iter().map(|m| (m.role, m.content.clone())).collect::<Vec<_>>()
    };
    let before = contents(&conversations.conversation(&id).await.unwrap().messages);

    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let err = conversations
        .send_message(&id, "ready for plan", Some(token))
        .await
        .unwrap_err();
    assert!(matches!(err, planloom::core::ConversationError::Llm(LlmError::Cancelled)));

    let conv = conversations.conversation(&id).await.unwrap();
    assert_eq!(conv.state, ConversationState::GatheringRequirements);
    assert_eq!(contents(&conv.messages), before);

    let mut path = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let planloom::core::EngineEvent::StateTransition { from_state, to_state, .. } = ev {
            path.push((from_state, to_state));
        }
    }
    assert_eq!(
        path.last(),
        Some(&(ConversationState::AnalyzingRequirements, ConversationState::GatheringRequirements))
    );
}
