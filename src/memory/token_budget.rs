//! 上下文预算控制
//!
//! 估算消息历史的 token 用量；超过 `max × trigger_ratio` 时把较早的对话交给摘要函数，
//! 用「系统提示（按模板 id 去重）+ 一条摘要消息 + 最近 N 条对话」替换原历史。
//! 仅当替换后 token 严格减少时才生效；记录压缩后的估算值，估算不变时不会再次触发。

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::LlmError;
use crate::llm::{ChatRequest, ProviderRegistry};
use crate::memory::{Message, Role};
use crate::prompts::defaults::SUMMARIZATION;
use crate::prompts::PromptEngine;

/// 每条消息的固定开销（角色标记、分隔符等）
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token 估算器（字符数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 约 4 字符 / token，向上取整
    pub fn estimate(text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    /// 单条消息的估算值，结果缓存在 metadata.token_count
    pub fn message_tokens(msg: &mut Message) -> usize {
        if let Some(cached) = msg.metadata.token_count {
            return cached;
        }
        let tokens = Self::estimate(&msg.content) + MESSAGE_OVERHEAD_TOKENS;
        msg.metadata.token_count = Some(tokens);
        tokens
    }

    /// 不写缓存的估算（只读历史用）
    pub fn peek_message_tokens(msg: &Message) -> usize {
        msg.metadata
            .token_count
            .unwrap_or_else(|| Self::estimate(&msg.content) + MESSAGE_OVERHEAD_TOKENS)
    }

    pub fn total(messages: &mut [Message]) -> usize {
        messages.iter_mut().map(Self::message_tokens).sum()
    }
}

/// 预算参数
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// 超过 max_tokens × trigger_ratio 时触发摘要
    pub trigger_ratio: f64,
    /// 摘要后保留的最近对话条数
    pub window_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            trigger_ratio: 0.7,
            window_size: 10,
        }
    }
}

/// 随对话持久化的预算状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextState {
    /// 最近一次的滚动摘要
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// 最近一次压缩后的估算 token 数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_tokens: Option<usize>,
}

/// 一次预算检查的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetOutcome {
    /// 未超出阈值，或上次压缩后估算未变
    WithinBudget { tokens: usize },
    /// 已摘要并替换历史
    Summarized { tokens_before: usize, tokens_after: usize },
    /// 超出阈值但无法再缩减（没有可摘要的旧对话，或摘要不更短）
    Irreducible { tokens: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ContextBudgetManager {
    config: ContextConfig,
}

impl ContextBudgetManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn threshold(&self, max_tokens: usize) -> usize {
        (max_tokens as f64 * self.config.trigger_ratio).floor() as usize
    }

    /// 是否需要摘要：超过阈值，且自上次压缩以来估算有增长
    pub fn needs_summarization(&self, total: usize, max_tokens: usize, state: &ContextState) -> bool {
        total > self.threshold(max_tokens) && state.compacted_tokens.map_or(true, |t| total > t)
    }

    /// 拆分历史：(去重后的系统提示, 待摘要的旧内容, 保留窗口)
    fn partition(&self, history: &[Message]) -> (Vec<Message>, Vec<Message>, Vec<Message>) {
        let mut prompts: Vec<Message> = Vec::new();
        let mut conversational: Vec<Message> = Vec::new();
        let mut older: Vec<Message> = Vec::new();

        for msg in history {
            if msg.is_summary() {
                older.push(msg.clone());
            } else if msg.role == Role::System {
                let duplicate = prompts.iter().any(|p| match (&p.metadata.template_id, &msg.metadata.template_id) {
                    (Some(a), Some(b)) => a == b,
                    (None, None) => p.content == msg.content,
                    _ => false,
                });
                if !duplicate {
                    prompts.push(msg.clone());
                }
            } else {
                conversational.push(msg.clone());
            }
        }

        let split = conversational.len().saturating_sub(self.config.window_size);
        let window = conversational.split_off(split);
        older.extend(conversational);
        (prompts, older, window)
    }

    /// 按预算检查并在需要时摘要；summarize 接收待摘要的消息，返回摘要文本
    pub async fn ensure_budget<F, Fut>(
        &self,
        history: &mut Vec<Message>,
        state: &mut ContextState,
        max_tokens: usize,
        summarize: F,
    ) -> Result<BudgetOutcome, LlmError>
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Result<String, LlmError>>,
    {
        let total = TokenEstimator::total(history);
        if !self.needs_summarization(total, max_tokens, state) {
            return Ok(BudgetOutcome::WithinBudget { tokens: total });
        }

        let (prompts, older, window) = self.partition(history);
        if older.is_empty() || older.iter().all(|m| m.is_summary()) {
            tracing::debug!(tokens = total, "context over budget but nothing left to summarize");
            state.compacted_tokens = Some(total);
            return Ok(BudgetOutcome::Irreducible { tokens: total });
        }

        tracing::info!(
            tokens = total,
            threshold = self.threshold(max_tokens),
            summarized = older.len(),
            kept = window.len(),
            "context over budget, summarizing"
        );
        let summary = summarize(older).await?;

        let mut trimmed = prompts;
        trimmed.push(Message::summary(format!(
            "Summary of the earlier conversation:\n{}",
            summary.trim()
        )));
        trimmed.extend(window);
        let after = TokenEstimator::total(&mut trimmed);

        if after >= total {
            tracing::warn!(before = total, after, "summary did not shrink the context, keeping history");
            state.compacted_tokens = Some(total);
            return Ok(BudgetOutcome::Irreducible { tokens: total });
        }

        *history = trimmed;
        state.summary = Some(summary);
        state.compacted_tokens = Some(after);
        Ok(BudgetOutcome::Summarized {
            tokens_before: total,
            tokens_after: after,
        })
    }
}

fn transcript_of(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 用 summarization 模板经注册表生成摘要，作为 `ensure_budget` 的摘要函数
pub async fn summarize_messages(
    registry: Arc<ProviderRegistry>,
    prompts: Arc<PromptEngine>,
    older: Vec<Message>,
    cancel: Option<CancellationToken>,
) -> Result<String, LlmError> {
    let text = transcript_of(&older);
    let prompt = prompts
        .render(SUMMARIZATION, &[("conversation", text.as_str())])
        .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
    let mut request = ChatRequest::new(vec![Message::user(prompt)]);
    request.cancel = cancel;
    let response = registry.send_message(&request).await?;
    Ok(response.content)
}
