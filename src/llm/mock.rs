//! Mock Provider（用于测试与离线运行，无需 API）
//!
//! 应答来源按优先级：脚本队列 → 处理函数 → 默认回显。支持模拟延迟、不可用与自定义上下文上限。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::Mutex;

use crate::core::LlmError;
use crate::llm::traits::{
    guarded_call, ChatProvider, ChatRequest, ChatResponse, ChatStream, StreamChunk, TokenUsage,
    DEFAULT_MAX_CONTEXT_TOKENS,
};
use crate::memory::Role;
use crate::memory::token_budget::TokenEstimator;

type Handler = Arc<dyn Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync>;

/// 脚本化 Mock Provider
pub struct MockProvider {
    id: String,
    model: String,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    handler: Option<Handler>,
    delay: Option<Duration>,
    max_context_tokens: usize,
    available: AtomicBool,
    calls: AtomicUsize,
    usage: TokenUsage,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: "mock-model".to_string(),
            script: Mutex::new(VecDeque::new()),
            handler: None,
            delay: None,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            usage: TokenUsage::new(),
        }
    }

    /// 按顺序返回给定应答，用完后落到处理函数或回显
    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = responses.into_iter().map(|r| Ok(r.into())).collect();
        Self {
            script: Mutex::new(queue),
            ..self
        }
    }

    /// 每次调用都交给 handler 决定应答
    pub fn from_fn<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        let mut provider = Self::new(id);
        provider.handler = Some(Arc::new(f));
        provider
    }

    /// 每次调用都返回同一个错误
    pub fn failing(id: impl Into<String>, err: LlmError) -> Self {
        Self::from_fn(id, move |_| Err(err.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub async fn push_response(&self, response: Result<String, LlmError>) {
        self.script.lock().await.push_back(response);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// chat 被调用的次数（含失败）
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next_reply(&self, request: &ChatRequest) -> Result<String, LlmError> {
        if let Some(scripted) = self.script.lock().await.pop_front() {
            return scripted;
        }
        if let Some(handler) = &self.handler {
            return handler(request);
        }
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from {}: {}", self.id, last_user))
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.unwrap_or(Duration::ZERO);
        let content = guarded_call(delay + Duration::from_secs(3600), request.cancel.as_ref(), async {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.next_reply(request).await
        })
        .await?;

        let prompt: usize = request
            .messages
            .iter()
            .map(|m| TokenEstimator::estimate(&m.content))
            .sum();
        let completion = TokenEstimator::estimate(&content);
        self.usage.add(prompt as u64, completion as u64);

        Ok(ChatResponse {
            content,
            provider: self.id.clone(),
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
    }

    /// 按词切分为多个增量，最后一个分片 done = true
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.chat(request).await?;
        let words: Vec<&str> = response.content.split_inclusive(' ').collect();
        let last = words.len().saturating_sub(1);
        let mut chunks: Vec<Result<StreamChunk, LlmError>> = words
            .iter()
            .enumerate()
            .map(|(i, w)| {
                Ok(StreamChunk {
                    delta: w.to_string(),
                    done: i == last,
                    finish_reason: (i == last).then(|| "stop".to_string()),
                })
            })
            .collect();
        if chunks.is_empty() {
            chunks.push(Ok(StreamChunk {
                delta: String::new(),
                done: true,
                finish_reason: Some("stop".to_string()),
            }));
        }
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(vec![self.model.clone()])
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
