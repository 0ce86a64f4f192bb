//! OpenAI 兼容 Provider
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek 等兼容服务复用本实现。
//! 存活探测与模型列表走 `GET {base}/models`。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;

use crate::core::LlmError;
use crate::llm::traits::{guarded_call, ChatProvider, ChatRequest, ChatResponse, TokenUsage, Usage};
use crate::memory::{Message, Role};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// OpenAI 兼容 Provider：持有 Client、模型名与累计用量
pub struct OpenAiProvider {
    id: String,
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    max_context_tokens: usize,
    usage: TokenUsage,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let base_url = base_url.unwrap_or(OPENAI_BASE_URL).trim_end_matches('/').to_string();

        let config = OpenAIConfig::new()
            .with_api_base(base_url.clone())
            .with_api_key(api_key.clone());

        Self {
            id: "openai".to_string(),
            client: Client::with_config(config),
            http: reqwest::Client::new(),
            base_url,
            api_key,
            model: model.to_string(),
            timeout: Duration::from_secs(60),
            max_context_tokens: 128_000,
            usage: TokenUsage::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::InvalidRequest(e.to_string()))
            })
            .collect()
    }

    async fn fetch_models(&self) -> Result<Vec<String>, LlmError> {
        let resp = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), &body));
        }
        let list: ModelList = resp.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// SDK 错误归类：先识别 API 错误类型关键词，其余交给文本分类
fn classify_openai_error(err: OpenAIError) -> LlmError {
    if let OpenAIError::InvalidArgument(msg) = err {
        return LlmError::InvalidRequest(msg);
    }
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("invalid_request_error")
        || lower.contains("invalid_api_key")
        || lower.contains("authentication")
    {
        LlmError::InvalidRequest(text)
    } else if lower.contains("rate_limit") {
        LlmError::rate_limited(text)
    } else {
        LlmError::from_message(&text)
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
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
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&model)
            .messages(Self::to_openai_messages(&request.messages)?);
        if let Some(t) = request.temperature {
            args.temperature(t);
        }
        if let Some(max) = request.max_tokens {
            args.max_completion_tokens(max);
        }
        let body = args
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = guarded_call(self.timeout, request.cancel.as_ref(), async {
            self.client
                .chat()
                .create(body)
                .await
                .map_err(classify_openai_error)
        })
        .await?;

        let usage = response.usage.as_ref().map(|u| Usage {
            prompt_tokens: u.prompt_tokens as u64,
            completion_tokens: u.completion_tokens as u64,
        });
        if let Some(u) = usage {
            self.usage.add(u.prompt_tokens, u.completion_tokens);
        }

        let first = response.choices.first();
        let content = first
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let finish_reason = first
            .and_then(|c| c.finish_reason.as_ref())
            .map(|r| format!("{:?}", r).to_lowercase());

        tracing::debug!(provider = %self.id, model = %model, chars = content.len(), "chat completed");

        Ok(ChatResponse {
            content,
            provider: self.id.clone(),
            model,
            finish_reason,
            usage,
        })
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            return false;
        }
        match self.fetch_models().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(provider = %self.id, error = %e, "health check failed");
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        self.fetch_models().await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
