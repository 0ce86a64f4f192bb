//! 单任务执行：置信度评估、执行提示、完成标记判定

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::autonomous::types::{
    FailureJournalEntry, VerificationPolicy, COMPLETION_MARKER, FAILURE_MARKER,
};
use crate::core::{LlmError, PromptError};
use crate::llm::{ChatRequest, ProviderRegistry};
use crate::memory::{summarize_messages, BudgetOutcome, ContextBudgetManager, ContextState, Message, TokenEstimator};
use crate::plan::parser::parse_json;
use crate::plan::{Phase, PhasePlan, PhaseTask};
use crate::prompts::defaults::{TASK_CONFIDENCE, TASK_EXECUTION};
use crate::prompts::PromptEngine;

pub const DEFAULT_CONFIDENCE: u8 = 50;

#[derive(Debug, Deserialize)]
struct ConfidenceReply {
    confidence: f64,
}

fn confidence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)"?confidence"?\s*[:=]\s*(\d{1,3})"#).expect("valid regex"))
}

/// 解析置信度（0-100）；无法解析时取默认值 50
pub fn parse_confidence(text: &str) -> u8 {
    if let Ok(reply) = parse_json::<ConfidenceReply>(text) {
        return reply.confidence.round().clamp(0.0, 100.0) as u8;
    }
    confidence_regex()
        .captures(text)
        .and_then(|c| c[1].parse::<u32>().ok())
        .map(|n| n.min(100) as u8)
        .unwrap_or(DEFAULT_CONFIDENCE)
}

/// 执行结果判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Completed,
    Failed(String),
}

/// 扫描完成 / 失败标记；失败标记优先
pub fn verify(output: &str, policy: VerificationPolicy) -> Verdict {
    if let Some(pos) = output.find(FAILURE_MARKER) {
        let reason = output[pos + FAILURE_MARKER.len()..]
            .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
            .lines()
            .next()
            .unwrap_or_default()
            .trim();
        let reason = if reason.is_empty() { "task reported failure" } else { reason };
        return Verdict::Failed(reason.to_string());
    }
    if output.contains(COMPLETION_MARKER) {
        return Verdict::Completed;
    }
    match policy {
        VerificationPolicy::Lenient => {
            tracing::warn!("no completion marker in task output, assuming success");
            Verdict::Completed
        }
        VerificationPolicy::Strict => Verdict::Failed(format!("response did not contain {}", COMPLETION_MARKER)),
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none given)".to_string();
    }
    items.iter().map(|i| format!("- {}", i)).collect::<Vec<_>>().join("\n")
}

fn numbered_list(items: &[String]) -> String {
    if items.is_empty() {
        return "1. Complete the goal.".to_string();
    }
    items
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s))
        .collect::<Vec<_>>()
        .join("\n")
}

fn failure_line(entry: &FailureJournalEntry) -> String {
    let mut line = format!("- iteration {}: {}", entry.iteration, entry.error);
    if let Some(analysis) = &entry.analysis {
        line.push_str(&format!(" (analysis: {})", analysis));
    }
    line
}

fn render_failures<I>(lines: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let lines: Vec<String> = lines.into_iter().collect();
    if lines.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nPrevious attempts at this task failed:\n");
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str("Avoid repeating these mistakes.\n");
    out
}

/// 把失败日志格式化为提示上下文
pub fn failure_context(journal: &[FailureJournalEntry]) -> String {
    render_failures(journal.iter().map(failure_line))
}

pub struct TaskExecutor {
    registry: Arc<ProviderRegistry>,
    prompts: Arc<PromptEngine>,
    policy: VerificationPolicy,
    context: ContextBudgetManager,
}

impl TaskExecutor {
    pub fn new(registry: Arc<ProviderRegistry>, prompts: Arc<PromptEngine>, policy: VerificationPolicy) -> Self {
        Self {
            registry,
            prompts,
            policy,
            context: ContextBudgetManager::default(),
        }
    }

    pub fn with_context(mut self, context: ContextBudgetManager) -> Self {
        self.context = context;
        self
    }

    /// 置信度评估；Provider 出错时按默认值处理，取消除外
    pub async fn confidence(
        &self,
        phase: &Phase,
        task: &PhaseTask,
        cancel: &CancellationToken,
    ) -> Result<u8, ExecutionError> {
        let criteria = bullet_list(&task.acceptance_criteria);
        let prompt = self.prompts.render(
            TASK_CONFIDENCE,
            &[
                ("phase_title", phase.title.as_str()),
                ("task_title", task.title.as_str()),
                ("task_goal", task.goal.as_str()),
                ("acceptance_criteria", criteria.as_str()),
            ],
        )?;
        let request = ChatRequest::new(vec![Message::user(prompt)]).with_cancel(cancel.child_token());
        match self.registry.send_message(&request).await {
            Ok(resp) => Ok(parse_confidence(&resp.content)),
            Err(LlmError::Cancelled) => Err(ExecutionError::Llm(LlmError::Cancelled)),
            Err(e) => {
                tracing::warn!(task = %task.id, error = %e, "confidence request failed, using default");
                Ok(DEFAULT_CONFIDENCE)
            }
        }
    }

    /// 执行任务并判定结果；返回 (判定, 原始输出)
    ///
    /// 失败日志按上下文预算压缩：较早的失败被摘要，最近的保留原文。
    pub async fn execute(
        &self,
        plan: &PhasePlan,
        phase: &Phase,
        task: &PhaseTask,
        journal: &[FailureJournalEntry],
        cancel: &CancellationToken,
    ) -> Result<(Verdict, String), ExecutionError> {
        let instructions = numbered_list(&task.instructions);
        let criteria = bullet_list(&task.acceptance_criteria);
        let render = |failures: &str| {
            self.prompts.render(
                TASK_EXECUTION,
                &[
                    ("plan_title", plan.title.as_str()),
                    ("phase_title", phase.title.as_str()),
                    ("phase_description", phase.description.as_str()),
                    ("task_title", task.title.as_str()),
                    ("task_goal", task.goal.as_str()),
                    ("instructions", instructions.as_str()),
                    ("acceptance_criteria", criteria.as_str()),
                    ("failure_context", failures),
                    ("completion_marker", COMPLETION_MARKER),
                    ("failure_marker", FAILURE_MARKER),
                ],
            )
        };

        let mut failures: Vec<Message> = journal.iter().map(|e| Message::user(failure_line(e))).collect();
        if !failures.is_empty() {
            let base = TokenEstimator::estimate(&render("")?);
            let budget = self.registry.max_context_tokens().saturating_sub(base);
            let registry = self.registry.clone();
            let prompts = self.prompts.clone();
            let token = Some(cancel.child_token());
            let outcome = self
                .context
                .ensure_budget(&mut failures, &mut ContextState::default(), budget, move |older| {
                    summarize_messages(registry, prompts, older, token)
                })
                .await?;
            if let BudgetOutcome::Summarized { tokens_before, tokens_after } = outcome {
                tracing::info!(task = %task.id, tokens_before, tokens_after, "failure history summarized");
            }
        }
        let prompt = render(&render_failures(failures.into_iter().map(|m| m.content)))?;

        let request = ChatRequest::new(vec![Message::user(prompt)]).with_cancel(cancel.child_token());
        let response = self.registry.send_message(&request).await?;
        Ok((verify(&response.content, self.policy), response.content))
    }
}

/// 单任务执行中的错误：Provider 错误按任务失败处理，模板错误终止循环
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Prompt(#[from] PromptError),
}
