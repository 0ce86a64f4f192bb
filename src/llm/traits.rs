//! Chat Provider 抽象
//!
//! 所有后端（Ollama / OpenAI / DeepSeek / Mock）实现 ChatProvider：chat（非流式）、stream_chat（增量）、
//! is_available（存活探测）、list_models。请求自带可选的取消令牌，Provider 必须在令牌触发时尽快返回 Cancelled。

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::LlmError;
use crate::memory::Message;

/// 未声明能力的 Provider 使用的上下文上限
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 8192;

/// 一次对话请求
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
    }
}

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// 非流式响应
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    /// 实际应答的 Provider id（回退后可能不是首选）
    pub provider: String,
    pub model: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// 流式增量
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
    pub finish_reason: Option<String>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// 累计 Token 使用统计
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// LLM 后端 trait
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// 注册表中的唯一 id，如 "ollama"、"openai"
    fn id(&self) -> &str;

    fn model(&self) -> &str;

    /// 该 Provider 可承载的上下文 token 上限（上下文预算按此计算）
    fn max_context_tokens(&self) -> usize {
        DEFAULT_MAX_CONTEXT_TOKENS
    }

    /// 非流式完成
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// 流式完成；默认把 chat 的结果包装成单个 done 分片
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.chat(request).await?;
        let chunk = StreamChunk {
            delta: response.content,
            done: true,
            finish_reason: Some(response.finish_reason.unwrap_or_else(|| "stop".to_string())),
        };
        Ok(Box::pin(stream::iter(vec![Ok(chunk)])))
    }

    /// 廉价的存活探测
    async fn is_available(&self) -> bool;

    async fn list_models(&self) -> Result<Vec<String>, LlmError>;

    /// 累计 token 使用：(prompt, completion, total)，默认 (0, 0, 0)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 为一次 Provider 调用加上超时与取消：超时得到 Timeout，令牌触发得到 Cancelled
pub async fn guarded_call<T, F>(
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    fut: F,
) -> Result<T, LlmError>
where
    F: Future<Output = Result<T, LlmError>>,
{
    let timed = async {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(format!(
                "no response within {} ms",
                timeout.as_millis()
            ))),
        }
    };
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(LlmError::Cancelled),
                result = timed => result,
            }
        }
        None => timed.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_guarded_call_times_out() {
        let result: Result<(), _> = guarded_call(Duration::from_millis(50), None, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(LlmError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_guarded_call_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<&str, _> =
            guarded_call(Duration::from_secs(5), Some(&token), async { Ok("late") }).await;
        assert_eq!(result, Err(LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_guarded_call_passes_through() {
        let result = guarded_call(Duration::from_secs(5), None, async { Ok::<_, LlmError>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn test_token_usage_accumulates() {
        let usage = TokenUsage::new();
        usage.add(10, 5);
        usage.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }
}
