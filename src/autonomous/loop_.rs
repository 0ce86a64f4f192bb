//! 自主执行循环
//!
//! 每轮：检查停止/暂停 → 校验任务完整性 → 按阶段顺序、任务顺序选第一个未完成任务 →
//! 置信度门控 → 执行并判定 → 更新计划、连击与失败日志 → 上报进度。
//! 暂停是协作式的：执行中的任务跑完后才会进入暂停轮询。停止则会取消本次运行的令牌，进行中的请求立即返回。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::autonomous::engine::LoopEngine;
use crate::autonomous::executor::{ExecutionError, TaskExecutor, Verdict};
use crate::autonomous::types::{FailureJournalEntry, LoopConfig, LoopReport, LoopStatus};
use crate::core::events::{send_event, EngineEvent, EventSender};
use crate::core::{LlmError, LoopError, PlanError};
use crate::llm::ProviderRegistry;
use crate::memory::ContextBudgetManager;
use crate::plan::{task_issues, PhasePlan, PhasePlanGenerator, PhaseTask, TaskStatus};
use crate::prompts::PromptEngine;

#[derive(Default)]
struct ControlFlags {
    running: AtomicBool,
    paused: AtomicBool,
    stop: AtomicBool,
    /// 本次运行的取消令牌；stop() 触发它，打断进行中的 Provider 调用与重试等待
    cancel: Mutex<CancellationToken>,
}

/// 循环控制句柄，可跨任务克隆
#[derive(Clone, Default)]
pub struct LoopControl {
    flags: Arc<ControlFlags>,
}

impl LoopControl {
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
        self.token().cancel();
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    /// 当前运行的取消令牌
    pub fn token(&self) -> CancellationToken {
        self.flags
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 标记开始；已在运行时返回 false
    fn begin(&self) -> bool {
        if self
            .flags
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.flags.stop.store(false, Ordering::SeqCst);
        *self.flags.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        true
    }

    fn finish(&self) {
        self.flags.running.store(false, Ordering::SeqCst);
        self.flags.paused.store(false, Ordering::SeqCst);
    }
}

/// 单轮结果
enum Step {
    Progressed,
    AllDone,
    Stopped,
}

/// 运行期可变状态
struct RunState {
    plan: PhasePlan,
    engine: LoopEngine,
    journal: HashMap<String, Vec<FailureJournalEntry>>,
    /// 因置信度过低而推迟的任务，只剩它们时清空重试
    deferred: HashSet<String>,
    cancel: CancellationToken,
}

fn task_key(phase_id: &str, task_id: &str) -> String {
    format!("{}/{}", phase_id, task_id)
}

/// 没有任务的阶段补一个由阶段本身派生的任务
pub fn ensure_tasks(plan: &mut PhasePlan) {
    for phase in plan.phases.iter_mut().filter(|p| p.tasks.is_empty()) {
        let status = if phase.status.is_done() {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        };
        phase.tasks.push(PhaseTask {
            id: format!("{}-task-1", phase.id),
            title: phase.title.clone(),
            goal: phase.description.clone(),
            files: phase.files.clone(),
            instructions: vec![phase.description.clone()],
            acceptance_criteria: vec![format!("{} is implemented", phase.title)],
            status,
        });
    }
}

/// 按阶段 order、任务顺序找第一个未完成任务；优先未推迟的
fn next_task(plan: &PhasePlan, deferred: &HashSet<String>) -> Option<(usize, usize)> {
    let mut order: Vec<usize> = (0..plan.phases.len()).collect();
    order.sort_by_key(|&i| plan.phases[i].order);

    let mut first_deferred = None;
    for pi in order {
        let phase = &plan.phases[pi];
        for (ti, task) in phase.tasks.iter().enumerate() {
            if task.status == TaskStatus::Completed {
                continue;
            }
            if deferred.contains(&task_key(&phase.id, &task.id)) {
                first_deferred.get_or_insert((pi, ti));
                continue;
            }
            return Some((pi, ti));
        }
    }
    first_deferred
}

pub struct AutonomousLoop {
    executor: TaskExecutor,
    generator: Arc<PhasePlanGenerator>,
    config: LoopConfig,
    control: LoopControl,
    events: Option<EventSender>,
}

impl AutonomousLoop {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        prompts: Arc<PromptEngine>,
        generator: Arc<PhasePlanGenerator>,
        config: LoopConfig,
    ) -> Self {
        Self {
            executor: TaskExecutor::new(registry, prompts, config.verification),
            generator,
            config,
            control: LoopControl::default(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// 执行提示中失败历史的预算参数
    pub fn with_context(mut self, context: ContextBudgetManager) -> Self {
        self.executor = self.executor.with_context(context);
        self
    }

    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// 运行直到完成、停止、迭代用尽或出错
    ///
    /// 没有计划时先按需求生成；这一步的错误直接返回。迭代中的错误以 `LoopStatus::Error` 报告。
    pub async fn run(
        &self,
        plan: Option<PhasePlan>,
        requirements: Option<&str>,
    ) -> Result<LoopReport, LoopError> {
        if !self.control.begin() {
            return Err(LoopError::AlreadyRunning);
        }
        let result = self.run_inner(plan, requirements).await;
        self.control.finish();
        result
    }

    async fn run_inner(
        &self,
        plan: Option<PhasePlan>,
        requirements: Option<&str>,
    ) -> Result<LoopReport, LoopError> {
        let cancel = self.control.token();
        let mut plan = match plan {
            Some(plan) => plan,
            None => {
                let requirements = requirements.ok_or(PlanError::NoRequirements)?;
                tracing::info!("no plan supplied, generating one");
                self.generator.generate(requirements, Some(cancel.child_token())).await?
            }
        };
        ensure_tasks(&mut plan);

        let mut state = RunState {
            plan,
            engine: LoopEngine::new(self.config.max_iterations),
            journal: HashMap::new(),
            deferred: HashSet::new(),
            cancel,
        };
        tracing::info!(
            plan = %state.plan.title,
            tasks = state.plan.total_task_count(),
            max_iterations = self.config.max_iterations,
            "autonomous loop started"
        );

        let status = loop {
            if self.control.stop_requested() {
                break LoopStatus::Stopped;
            }
            if self.control.is_paused() {
                self.report_progress(&state, LoopStatus::Paused);
                tracing::info!("autonomous loop paused");
                while self.control.is_paused() && !self.control.stop_requested() {
                    tokio::time::sleep(self.config.pause_poll_interval).await;
                }
                continue;
            }
            if next_task(&state.plan, &state.deferred).is_none() {
                break LoopStatus::Completed;
            }
            if !state.engine.can_continue() {
                break LoopStatus::Exhausted;
            }

            state.engine.increment_iteration();
            match self.run_iteration(&mut state).await {
                Ok(Step::Progressed) => self.report_progress(&state, LoopStatus::Running),
                Ok(Step::AllDone) => break LoopStatus::Completed,
                Ok(Step::Stopped) => break LoopStatus::Stopped,
                Err(e) => {
                    tracing::error!(iteration = state.engine.current_iteration(), error = %e, "iteration failed");
                    break LoopStatus::Error;
                }
            }
        };

        let report = LoopReport {
            status,
            iterations: state.engine.current_iteration(),
            completed_tasks: state.plan.completed_task_count(),
            total_tasks: state.plan.total_task_count(),
            combo_multiplier: state.engine.combo_multiplier(),
            achievements: state.engine.achievements(),
            failure_journal: state.journal,
            plan: state.plan,
        };
        tracing::info!(
            status = %report.status,
            iterations = report.iterations,
            completed = report.completed_tasks,
            total = report.total_tasks,
            "autonomous loop finished"
        );
        send_event(
            &self.events,
            EngineEvent::Completion {
                success: report.success(),
                iterations: report.iterations,
                status: report.status.to_string(),
            },
        );
        Ok(report)
    }

    /// 计划不完整时的细化扩展点；目前原样返回
    fn refine(&self, plan: &mut PhasePlan, issues: &[String]) {
        tracing::debug!(issues = issues.len(), plan = %plan.title, "plan refinement requested");
    }

    async fn run_iteration(&self, state: &mut RunState) -> Result<Step, ExecutionError> {
        let iteration = state.engine.current_iteration();

        let issues = task_issues(&state.plan);
        if !issues.is_empty() {
            self.refine(&mut state.plan, &issues);
            if !task_issues(&state.plan).is_empty() {
                tracing::warn!(iteration, issues = ?issues, "plan has incomplete tasks, retrying next iteration");
                return Ok(Step::Progressed);
            }
        }

        let Some((pi, ti)) = next_task(&state.plan, &state.deferred) else {
            return Ok(Step::AllDone);
        };
        let phase = state.plan.phases[pi].clone();
        let task = phase.tasks[ti].clone();
        let key = task_key(&phase.id, &task.id);

        // 只剩被推迟的任务时，重新给它们机会
        if state.deferred.contains(&key) {
            state.deferred.clear();
        }

        let confidence = match self.executor.confidence(&phase, &task, &state.cancel).await {
            Ok(c) => c,
            Err(ExecutionError::Llm(LlmError::Cancelled)) => return Ok(Step::Stopped),
            Err(e) => return Err(e),
        };
        if confidence < self.config.confidence_threshold {
            tracing::info!(iteration, task = %key, confidence, "low confidence, skipping task this iteration");
            state.deferred.insert(key);
            return Ok(Step::Progressed);
        }

        let history = match state.journal.get_mut(&key) {
            Some(journal) => {
                let prior = journal.len();
                if let Some(last) = journal.last_mut() {
                    last.correction = Some(format!(
                        "retried in iteration {} with {} prior failure(s) as context",
                        iteration, prior
                    ));
                }
                journal.clone()
            }
            None => Vec::new(),
        };

        tracing::info!(iteration, task = %key, confidence, "executing task");
        state.plan.set_task_status(&phase.id, &task.id, TaskStatus::InProgress);
        let outcome = self
            .executor
            .execute(&state.plan, &phase, &task, &history, &state.cancel)
            .await;

        let failure = match outcome {
            Ok((Verdict::Completed, _)) => None,
            Ok((Verdict::Failed(reason), output)) => Some((reason, Some(excerpt(&output)))),
            Err(ExecutionError::Llm(LlmError::Cancelled)) => {
                state.plan.set_task_status(&phase.id, &task.id, TaskStatus::Pending);
                return Ok(Step::Stopped);
            }
            Err(ExecutionError::Llm(e)) => Some((e.to_string(), None)),
            Err(e) => return Err(e),
        };

        match failure {
            None => {
                let phase_done = state.plan.mark_task_completed(&phase.id, &task.id);
                let unlocked = state.engine.record_success(phase_done);
                tracing::info!(
                    iteration,
                    task = %key,
                    phase_completed = phase_done,
                    combo = state.engine.combo_multiplier(),
                    "task completed"
                );
                for achievement in unlocked {
                    tracing::info!(achievement = achievement.as_str(), "achievement unlocked");
                }
            }
            Some((error, analysis)) => {
                state.plan.set_task_status(&phase.id, &task.id, TaskStatus::Pending);
                state.engine.record_failure();
                tracing::warn!(iteration, task = %key, error = %error, "task failed");
                state
                    .journal
                    .entry(key)
                    .or_default()
                    .push(FailureJournalEntry {
                        iteration,
                        error,
                        analysis,
                        correction: None,
                        timestamp: Utc::now(),
                    });
            }
        }
        Ok(Step::Progressed)
    }

    fn report_progress(&self, state: &RunState, status: LoopStatus) {
        send_event(
            &self.events,
            EngineEvent::Progress {
                iteration: state.engine.current_iteration(),
                max_iterations: state.engine.max_iterations(),
                completed_tasks: state.plan.completed_task_count(),
                total_tasks: state.plan.total_task_count(),
                status: status.to_string(),
                combo_multiplier: state.engine.combo_multiplier(),
                achievements: state.engine.achievements(),
            },
        );
    }
}

/// 失败输出的前 200 个字符，作为分析记录
fn excerpt(output: &str) -> String {
    let trimmed = output.trim();
    let mut out: String = trimmed.chars().take(200).collect();
    if trimmed.chars().count() > 200 {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::RetryOptions;
    use crate::llm::MockProvider;
    use crate::plan::types::fixtures::{phase, task};
    use crate::plan::PhaseStatus;
    use std::time::Duration;

    fn plan_with_tasks() -> PhasePlan {
        PhasePlan::new(
            "Todo",
            "Todo app",
            vec![
                phase("phase-001", 1, &[], vec![task("t1"), task("t2")]),
                phase("phase-002", 2, &["phase-001"], vec![task("t3")]),
            ],
        )
    }

    #[test]
    fn test_ensure_tasks_fills_empty_phases() {
        let mut plan = PhasePlan::new(
            "P",
            "D",
            vec![phase("phase-001", 1, &[], vec![]), phase("phase-002", 2, &[], vec![task("x")])],
        );
        plan.phases[0].status = PhaseStatus::Completed;
        ensure_tasks(&mut plan);
        assert_eq!(plan.phases[0].tasks.len(), 1);
        assert_eq!(plan.phases[0].tasks[0].id, "phase-001-task-1");
        assert_eq!(plan.phases[0].tasks[0].status, TaskStatus::Completed);
        assert_eq!(plan.phases[1].tasks.len(), 1);
    }

    #[test]
    fn test_next_task_respects_phase_order() {
        let mut plan = plan_with_tasks();
        plan.phases.swap(0, 1);
        let none = HashSet::new();
        let (pi, ti) = next_task(&plan, &none).unwrap();
        assert_eq!(plan.phases[pi].tasks[ti].id, "t1");

        let deferred: HashSet<String> = [task_key("phase-001", "t1")].into_iter().collect();
        let (pi, ti) = next_task(&plan, &deferred).unwrap();
        assert_eq!(plan.phases[pi].tasks[ti].id, "t2");
    }

    #[test]
    fn test_only_deferred_left_is_still_selected() {
        let mut plan = plan_with_tasks();
        plan.mark_task_completed("phase-001", "t2");
        plan.mark_task_completed("phase-002", "t3");
        let deferred: HashSet<String> = [task_key("phase-001", "t1")].into_iter().collect();
        assert!(next_task(&plan, &deferred).is_some());
    }

    fn looper(provider: MockProvider, config: LoopConfig) -> AutonomousLoop {
        let mut reg = ProviderRegistry::new()
            .with_priority(["mock"])
            .with_retry(RetryOptions::new(0).with_delays(Duration::ZERO, Duration::ZERO));
        reg.register(Arc::new(provider));
        let registry = Arc::new(reg);
        let prompts = Arc::new(PromptEngine::with_defaults());
        let generator = Arc::new(PhasePlanGenerator::new(registry.clone(), prompts.clone()));
        AutonomousLoop::new(registry, prompts, generator, config)
    }

    fn confident_completer() -> MockProvider {
        MockProvider::from_fn("mock", |req| {
            let prompt = &req.messages[0].content;
            if prompt.starts_with("Rate how confident") {
                Ok(r#"{"confidence": 90}"#.to_string())
            } else {
                Ok("Implemented.\nTASK_COMPLETE".to_string())
            }
        })
    }

    #[tokio::test]
    async fn test_runs_plan_to_completion() {
        let lp = looper(confident_completer(), LoopConfig::default());
        let report = lp.run(Some(plan_with_tasks()), None).await.unwrap();
        assert_eq!(report.status, LoopStatus::Completed);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.completed_tasks, 3);
        assert!(report.plan.phases.iter().all(|p| p.status == PhaseStatus::Completed));
        assert!(report.achievements.contains(&"phase_complete".to_string()));
        assert!(!lp.control().is_running());
    }

    #[tokio::test]
    async fn test_failure_is_journaled_and_fed_back() {
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = attempts.clone();
        let provider = MockProvider::from_fn("mock", move |req| {
            let prompt = &req.messages[0].content;
            if prompt.starts_with("Rate how confident") {
                return Ok(r#"{"confidence": 80}"#.to_string());
            }
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("TASK_FAILED: migrations missing".to_string())
            } else {
                assert!(prompt.contains("migrations missing"));
                Ok("TASK_COMPLETE".to_string())
            }
        });
        let lp = looper(provider, LoopConfig::default());
        let report = lp.run(Some(plan_with_tasks()), None).await.unwrap();
        assert_eq!(report.status, LoopStatus::Completed);
        assert_eq!(report.iterations, 4);
        let entries = &report.failure_journal[&task_key("phase-001", "t1")];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error, "migrations missing");
        assert!(entries[0].correction.is_some());
        assert!(report.achievements.contains(&"comeback".to_string()));
    }

    #[tokio::test]
    async fn test_low_confidence_skips_without_failure() {
        let provider = MockProvider::from_fn("mock", |req| {
            let prompt = &req.messages[0].content;
            if prompt.starts_with("Rate how confident") {
                if prompt.contains("Task t1") {
                    Ok(r#"{"confidence": 10}"#.to_string())
                } else {
                    Ok(r#"{"confidence": 95}"#.to_string())
                }
            } else {
                Ok("TASK_COMPLETE".to_string())
            }
        });
        let config = LoopConfig {
            max_iterations: 6,
            ..LoopConfig::default()
        };
        let report = looper(provider, config).run(Some(plan_with_tasks()), None).await.unwrap();
        assert_eq!(report.status, LoopStatus::Exhausted);
        assert_eq!(report.completed_tasks, 2);
        assert!(report.failure_journal.values().all(|v| v.is_empty()));
        assert_eq!(report.combo_multiplier, 1.3);
    }

    #[tokio::test]
    async fn test_strict_policy_needs_marker() {
        let provider = MockProvider::from_fn("mock", |req| {
            if req.messages[0].content.starts_with("Rate how confident") {
                Ok(r#"{"confidence": 90}"#.to_string())
            } else {
                Ok("I think it's done".to_string())
            }
        });
        let config = LoopConfig {
            max_iterations: 2,
            verification: crate::autonomous::VerificationPolicy::Strict,
            ..LoopConfig::default()
        };
        let report = looper(provider, config).run(Some(plan_with_tasks()), None).await.unwrap();
        assert_eq!(report.status, LoopStatus::Exhausted);
        assert_eq!(report.completed_tasks, 0);
        assert_eq!(report.failure_journal[&task_key("phase-001", "t1")].len(), 2);
    }

    #[tokio::test]
    async fn test_stop_halts_after_current_task() {
        let control = Arc::new(std::sync::Mutex::new(None::<LoopControl>));
        let slot = control.clone();
        let provider = MockProvider::from_fn("mock", move |req| {
            if req.messages[0].content.starts_with("Rate how confident") {
                return Ok(r#"{"confidence": 90}"#.to_string());
            }
            if let Some(c) = slot.lock().unwrap().as_ref() {
                c.stop();
            }
            Ok("TASK_COMPLETE".to_string())
        });
        let lp = looper(provider, LoopConfig::default());
        *control.lock().unwrap() = Some(lp.control());
        let report = lp.run(Some(plan_with_tasks()), None).await.unwrap();
        assert_eq!(report.status, LoopStatus::Stopped);
        assert_eq!(report.completed_tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_slow_provider_call() {
        let lp = Arc::new(looper(
            confident_completer().with_delay(Duration::from_secs(3)),
            LoopConfig::default(),
        ));
        let control = lp.control();
        let runner = lp.clone();
        let started = tokio::time::Instant::now();
        let handle = tokio::spawn(async move { runner.run(Some(plan_with_tasks()), None).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        control.stop();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, LoopStatus::Stopped);
        assert_eq!(report.completed_tasks, 0);
        assert!(report.failure_journal.values().all(|v| v.is_empty()));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!control.is_running());
    }

    #[tokio::test]
    async fn test_run_after_stop_gets_fresh_token() {
        let lp = looper(confident_completer(), LoopConfig::default());
        let control = lp.control();
        control.stop();
        assert!(control.token().is_cancelled());
        let report = lp.run(Some(plan_with_tasks()), None).await.unwrap();
        assert_eq!(report.status, LoopStatus::Completed);
        assert!(!control.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let lp = Arc::new(looper(confident_completer(), LoopConfig::default()));
        let control = lp.control();
        control.pause();
        let runner = lp.clone();
        let handle = tokio::spawn(async move { runner.run(Some(plan_with_tasks()), None).await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(control.is_running());
        assert!(control.is_paused());
        assert!(matches!(lp.run(None, None).await, Err(LoopError::AlreadyRunning)));

        control.resume();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, LoopStatus::Completed);
        assert_eq!(report.iterations, 3);
    }

    #[tokio::test]
    async fn test_setup_error_propagates() {
        let lp = looper(confident_completer(), LoopConfig::default());
        assert!(matches!(
            lp.run(None, None).await,
            Err(LoopError::Plan(PlanError::NoRequirements))
        ));
        assert!(!lp.control().is_running());
    }

    #[tokio::test]
    async fn test_template_error_reports_error_status() {
        let mut reg = ProviderRegistry::new().with_priority(["mock"]);
        reg.register(Arc::new(confident_completer()));
        let registry = Arc::new(reg);
        let prompts = Arc::new(PromptEngine::empty());
        let generator = Arc::new(PhasePlanGenerator::new(registry.clone(), prompts.clone()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let lp = AutonomousLoop::new(registry, prompts, generator, LoopConfig::default()).with_events(tx);
        let report = lp.run(Some(plan_with_tasks()), None).await.unwrap();
        assert_eq!(report.status, LoopStatus::Error);
        let mut completion = None;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::Completion { success, status, .. } = ev {
                completion = Some((success, status));
            }
        }
        assert_eq!(completion, Some((false, "error".to_string())));
    }
}
