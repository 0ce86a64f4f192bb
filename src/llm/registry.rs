//! Provider 注册表：优先级顺序、回退分发、健康探测缓存
//!
//! 分发路径：按优先级取下一个未尝试的 Provider，用重试执行器包裹调用；
//! 某个 Provider 重试耗尽后换下一个，全部耗尽时返回最后一个错误。取消立即终止整个回退链。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::core::retry::{retry_with_backoff, RetryOptions};
use crate::core::LlmError;
use crate::llm::traits::{ChatProvider, ChatRequest, ChatResponse, ChatStream, DEFAULT_MAX_CONTEXT_TOKENS};

/// 默认优先级：本地优先，其次云端
pub const DEFAULT_PRIORITY: &[&str] = &["ollama", "openai", "deepseek"];

#[derive(Debug, Clone, Copy)]
struct HealthEntry {
    healthy: bool,
    checked_at: Instant,
}

/// 健康状态快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHealth {
    pub id: String,
    pub healthy: bool,
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    registration_order: Vec<String>,
    priority: Vec<String>,
    retry: RetryOptions,
    health: RwLock<HashMap<String, HealthEntry>>,
    health_ttl: Duration,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            registration_order: Vec::new(),
            priority: DEFAULT_PRIORITY.iter().map(|s| s.to_string()).collect(),
            retry: RetryOptions::default(),
            health: RwLock::new(HashMap::new()),
            health_ttl: Duration::from_secs(30),
        }
    }

    pub fn with_priority<I, S>(mut self, priority: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority = priority.into_iter().map(Into::into).collect();
        self
    }

    /// 每个 Provider 调用使用的重试参数（cancel 字段由请求覆盖）
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_health_ttl(mut self, ttl: Duration) -> Self {
        self.health_ttl = ttl;
        self
    }

    /// 注册 Provider；同 id 重复注册时替换旧实例，位置不变
    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        let id = provider.id().to_string();
        if !self.registration_order.contains(&id) {
            self.registration_order.push(id.clone());
        }
        tracing::info!(provider = %id, model = %provider.model(), "provider registered");
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// 有效顺序：优先级列表中已注册的 id，然后是其余 Provider（按注册顺序）
    pub fn ordered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .priority
            .iter()
            .filter(|id| self.providers.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in &self.registration_order {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// 按优先级返回第一个不在 excluded 中的 Provider
    pub fn next_available_provider(&self, excluded: &[String]) -> Option<Arc<dyn ChatProvider>> {
        self.ordered_ids()
            .into_iter()
            .find(|id| !excluded.contains(id))
            .and_then(|id| self.get(&id))
    }

    /// 首选 Provider 的上下文上限，空注册表时为默认值
    pub fn max_context_tokens(&self) -> usize {
        self.next_available_provider(&[])
            .map(|p| p.max_context_tokens())
            .unwrap_or(DEFAULT_MAX_CONTEXT_TOKENS)
    }

    fn retry_for(&self, request: &ChatRequest) -> RetryOptions {
        let mut options = self.retry.clone();
        if let Some(token) = &request.cancel {
            options.cancel = Some(token.clone());
        }
        options
    }

    async fn record_health(&self, id: &str, healthy: bool) {
        self.health.write().await.insert(
            id.to_string(),
            HealthEntry {
                healthy,
                checked_at: Instant::now(),
            },
        );
    }

    /// 非流式分发：逐个 Provider 重试 + 回退
    pub async fn send_message(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let options = self.retry_for(request);
        let mut tried: Vec<String> = Vec::new();
        let mut last_err: Option<LlmError> = None;

        while let Some(provider) = self.next_available_provider(&tried) {
            let id = provider.id().to_string();
            tried.push(id.clone());
            tracing::debug!(provider = %id, attempt = tried.len(), "dispatching chat request");

            match retry_with_backoff(&options, || provider.chat(request)).await {
                Ok(response) => {
                    if tried.len() > 1 {
                        tracing::info!(provider = %id, "fallback provider succeeded");
                    }
                    self.record_health(&id, true).await;
                    return Ok(response);
                }
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                Err(e) => {
                    tracing::warn!(provider = %id, error = %e, "provider failed, trying next");
                    self.record_health(&id, false).await;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::InvalidRequest("no providers registered".to_string())))
    }

    /// 流式分发：同样的回退顺序作用于流的建立阶段
    pub async fn stream_message(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let options = self.retry_for(request);
        let mut tried: Vec<String> = Vec::new();
        let mut last_err: Option<LlmError> = None;

        while let Some(provider) = self.next_available_provider(&tried) {
            let id = provider.id().to_string();
            tried.push(id.clone());
            match retry_with_backoff(&options, || provider.stream_chat(request)).await {
                Ok(stream) => return Ok(stream),
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                Err(e) => {
                    tracing::warn!(provider = %id, error = %e, "stream setup failed, trying next");
                    self.record_health(&id, false).await;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::InvalidRequest("no providers registered".to_string())))
    }

    /// 健康探测；缓存未过期且未强制时直接返回缓存结果
    pub async fn check_health(&self, id: &str, force: bool) -> bool {
        if !force {
            if let Some(entry) = self.health.read().await.get(id) {
                if entry.checked_at.elapsed() < self.health_ttl {
                    return entry.healthy;
                }
            }
        }
        let Some(provider) = self.get(id) else {
            return false;
        };
        let healthy = provider.is_available().await;
        tracing::debug!(provider = %id, healthy, "health check");
        self.record_health(id, healthy).await;
        healthy
    }

    /// 按有效顺序探测全部 Provider
    pub async fn check_all_health(&self) -> Vec<ProviderHealth> {
        let mut out = Vec::new();
        for id in self.ordered_ids() {
            let healthy = self.check_health(&id, false).await;
            out.push(ProviderHealth { id, healthy });
        }
        out
    }

    /// 所有 Provider 的累计 token 用量
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.providers.values().fold((0, 0, 0), |acc, p| {
            let (a, b, c) = p.token_usage();
            (acc.0 + a, acc.1 + b, acc.2 + c)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;
    use crate::memory::Message;

    fn fast_retry(max_retries: u32) -> RetryOptions {
        RetryOptions::new(max_retries)
            .with_delays(Duration::from_millis(1), Duration::from_millis(2))
            .with_jitter(false)
    }

    #[test]
    fn test_priority_then_registration_order() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(MockProvider::new("custom")));
        reg.register(Arc::new(MockProvider::new("deepseek")));
        reg.register(Arc::new(MockProvider::new("ollama")));
        assert_eq!(reg.ordered_ids(), vec!["ollama", "deepseek", "custom"]);

        let next = reg
            .next_available_provider(&["ollama".to_string()])
            .unwrap();
        assert_eq!(next.id(), "deepseek");
        assert!(reg
            .next_available_provider(&["ollama".into(), "deepseek".into(), "custom".into()])
            .is_none());
    }

    #[tokio::test]
    async fn test_empty_registry_errors() {
        let reg = ProviderRegistry::new();
        let err = reg
            .send_message(&ChatRequest::new(vec![Message::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_health_cache_respects_force() {
        let mock = Arc::new(MockProvider::new("a"));
        let mut reg = ProviderRegistry::new().with_health_ttl(Duration::from_secs(60));
        reg.register(mock.clone());

        assert!(reg.check_health("a", false).await);
        mock.set_available(false);
        assert!(reg.check_health("a", false).await, "cached value served");
        assert!(!reg.check_health("a", true).await);
        assert!(!reg.check_health("missing", true).await);
    }

    #[tokio::test]
    async fn test_non_retryable_moves_to_next_provider() {
        let a = Arc::new(MockProvider::failing(
            "a",
            LlmError::InvalidRequest("bad key".into()),
        ));
        let b = Arc::new(MockProvider::new("b").with_responses(["from b"]));
        let mut reg = ProviderRegistry::new()
            .with_priority(["a", "b"])
            .with_retry(fast_retry(3));
        reg.register(a.clone());
        reg.register(b.clone());

        let resp = reg
            .send_message(&ChatRequest::new(vec![Message::user("x")]))
            .await
            .unwrap();
        assert_eq!(resp.content, "from b");
        assert_eq!(resp.provider, "b");
        assert_eq!(a.call_count(), 1);
    }

    #[test]
    fn test_max_context_tokens_follows_primary() {
        let mut reg = ProviderRegistry::new().with_priority(["big"]);
        assert_eq!(reg.max_context_tokens(), DEFAULT_MAX_CONTEXT_TOKENS);
        reg.register(Arc::new(MockProvider::new("big").with_max_context_tokens(100_000)));
        assert_eq!(reg.max_context_tokens(), 100_000);
    }
}
