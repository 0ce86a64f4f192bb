//! 自主循环与上下文预算的端到端行为

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use planloom::autonomous::{AutonomousLoop, LoopConfig, LoopStatus};
use planloom::core::{EngineEvent, LlmError, LoopError, PlanError, RetryOptions};
use planloom::llm::{MockProvider, ProviderRegistry};
use planloom::memory::{BudgetOutcome, ContextBudgetManager, ContextConfig, ContextState, Message};
use planloom::plan::PhasePlanGenerator;
use planloom::prompts::PromptEngine;
use tokio::sync::mpsc;

const FIVE_TASK_PLAN: &str = r#"{"title": "Notes", "description": "A small notes service", "phases": [
  {"title": "Setup", "description": "Scaffold", "tasks": [
    {"title": "Repo", "goal": "Create the repository"},
    {"title": "CI", "goal": "Add a CI pipeline"},
    {"title": "Lint", "goal": "Configure linting"}]},
  {"title": "Storage", "description": "Persist notes", "dependencies": [1], "tasks": [
    {"title": "Schema", "goal": "Define the notes table"}]},
  {"title": "API", "description": "HTTP endpoints", "dependencies": [2], "tasks": [
    {"title": "Routes", "goal": "Expose CRUD routes"}]}
]}"#;

fn autonomous(provider: MockProvider) -> AutonomousLoop {
    let mut reg = ProviderRegistry::new()
        .with_priority(["mock"])
        .with_retry(RetryOptions::new(0).with_delays(Duration::ZERO, Duration::ZERO));
    reg.register(Arc::new(provider));
    let registry = Arc::new(reg);
    let prompts = Arc::new(PromptEngine::with_defaults());
    let generator = Arc::new(PhasePlanGenerator::new(registry.clone(), prompts.clone()));
    AutonomousLoop::new(registry, prompts, generator, LoopConfig::default())
}

/// 计划生成、置信度与执行三类请求按提示词开头路由；execution 决定执行应答
fn provider_with<F>(execution: F) -> MockProvider
where
    F: Fn() -> String + Send + Sync + 'static,
{
    MockProvider::from_fn("mock", move |req| {
        let prompt = req.messages.first().map(|m| m.content.as_str()).unwrap_or("");
        if prompt.starts_with("You are a technical project planner") {
            Ok(FIVE_TASK_PLAN.to_string())
        } else if prompt.starts_with("Rate how confident") {
            Ok(r#"{"confidence": 90, "reasoning": "clear task"}"#.to_string())
        } else {
            Ok(execution())
        }
    })
}

#[tokio::test]
async fn test_five_successes_reach_max_combo() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let looper = autonomous(provider_with(|| "Implemented. TASK_COMPLETE".to_string())).with_events(tx);

    let report = looper
        .run(None, Some("Build a small notes service with storage and an API"))
        .await
        .unwrap();
    assert_eq!(report.status, LoopStatus::Completed);
    assert!(report.success());
    assert_eq!(report.iterations, 5);
    assert_eq!((report.completed_tasks, report.total_tasks), (5, 5));
    assert_eq!(report.combo_multiplier, 2.0);
    assert_eq!(
        report.achievements.iter().filter(|a| a.as_str() == "perfectionist").count(),
        1
    );
    assert!(report.achievements.iter().any(|a| a == "first_task"));
    assert!(report.achievements.iter().any(|a| a == "phase_complete"));
    assert!(report.failure_journal.is_empty());

    let mut combos = Vec::new();
    let mut completion = None;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            EngineEvent::Progress { combo_multiplier, .. } => combos.push(combo_multiplier),
            EngineEvent::Completion { success, iterations, .. } => completion = Some((success, iterations)),
            _ => {}
        }
    }
    assert_eq!(combos, vec![1.1, 1.3, 1.6, 2.0, 2.0]);
    assert_eq!(completion, Some((true, 5)));
}

#[tokio::test]
async fn test_failure_is_journaled_and_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let looper = autonomous(provider_with(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            "TASK_FAILED: the repository host was unreachable".to_string()
        } else {
            "TASK_COMPLETE".to_string()
        }
    }));

    let report = looper.run(None, Some("Build a small notes service")).await.unwrap();
    assert_eq!(report.status, LoopStatus::Completed);
    assert_eq!(report.iterations, 6);
    assert!(report.achievements.iter().any(|a| a == "comeback"));

    let journal = report.failure_journal.get("phase-001/phase-001-task-01").unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].iteration, 1);
    assert!(journal[0].correction.is_some());
}

#[tokio::test]
async fn test_exhausted_when_iterations_run_out() {
    let mut reg = ProviderRegistry::new().with_priority(["mock"]);
    reg.register(Arc::new(provider_with(|| "TASK_FAILED: nope".to_string())));
    let registry = Arc::new(reg);
    let prompts = Arc::new(PromptEngine::with_defaults());
    let generator = Arc::new(PhasePlanGenerator::new(registry.clone(), prompts.clone()));
    let config = LoopConfig {
        max_iterations: 3,
        ..LoopConfig::default()
    };
    let report = AutonomousLoop::new(registry, prompts, generator, config)
        .run(None, Some("Build a small notes service"))
        .await
        .unwrap();
    assert_eq!(report.status, LoopStatus::Exhausted);
    assert_eq!(report.iterations, 3);
    assert_eq!(report.completed_tasks, 0);
}

#[tokio::test]
async fn test_summarization_is_idempotent() {
    let manager = ContextBudgetManager::new(ContextConfig {
        trigger_ratio: 0.7,
        window_size: 10,
    });
    let mut history = vec![Message::system("You gather requirements.")];
    for i in 0..20 {
        history.push(Message::user(format!("{:03} {}", i, "requirement detail ".repeat(10))));
        history.push(Message::assistant(format!("{:03} {}", i, "acknowledged point ".repeat(10))));
    }
    let mut state = ContextState::default();
    let summaries = AtomicUsize::new(0);

    let first = manager
        .ensure_budget(&mut history, &mut state, 1500, |older| {
            summaries.fetch_add(1, Ordering::SeqCst);
            let count = older.len();
            async move { Ok(format!("{} earlier messages about requirements", count)) }
        })
        .await
        .unwrap();
    assert!(matches!(first, BudgetOutcome::Summarized { .. }));
    let after_first = history.clone();
    assert_eq!(history.iter().filter(|m| m.is_summary()).count(), 1);
    assert_eq!(history.len(), 1 + 1 + 10);

    let second = manager
        .ensure_budget(&mut history, &mut state, 1500, |_| {
            summaries.fetch_add(1, Ordering::SeqCst);
            async { Ok("should not be called".to_string()) }
        })
        .await
        .unwrap();
    assert!(matches!(second, BudgetOutcome::WithinBudget { .. }));
    assert_eq!(summaries.load(Ordering::SeqCst), 1);
    assert_eq!(history.len(), after_first.len());
    assert!(history.iter().zip(&after_first).all(|(a, b)| a.content == b.content));
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_in_flight_generation() {
    let provider = provider_with(|| "TASK_COMPLETE".to_string()).with_delay(Duration::from_secs(5));
    let looper = Arc::new(autonomous(provider));
    let control = looper.control();
    let runner = looper.clone();
    let started = tokio::time::Instant::now();
    let handle = tokio::spawn(async move { runner.run(None, Some("Build a small notes service")).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(control.is_running());
    control.stop();

    // 计划还没生成出来，停止以取消错误的形式返回
    let result = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(LoopError::Plan(PlanError::Llm(LlmError::Cancelled)))
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!control.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_task_execution() {
    let provider = provider_with(|| "TASK_COMPLETE".to_string()).with_delay(Duration::from_secs(2));
    let looper = Arc::new(autonomous(provider));
    let control = looper.control();
    let runner = looper.clone();
    let handle = tokio::spawn(async move { runner.run(None, Some("Build a small notes service")).await });

    // 计划生成 2s，第一项置信度 2s，停在第一项执行的中途
    tokio::time::sleep(Duration::from_secs(5)).await;
    let stopped_at = tokio::time::Instant::now();
    control.stop();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, LoopStatus::Stopped);
    assert_eq!(report.completed_tasks, 0);
    assert!(report.failure_journal.values().all(|v| v.is_empty()));
    assert!(stopped_at.elapsed() < Duration::from_millis(500));
}
