//! Ollama Provider（本地推理）
//!
//! 直接调用 Ollama HTTP API：`POST /api/chat`（stream=false）与 `GET /api/tags`。
//! 无需 API Key，注册表中默认排在云端 Provider 之前。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::LlmError;
use crate::llm::traits::{guarded_call, ChatProvider, ChatRequest, ChatResponse, TokenUsage, Usage};

pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
pub const OLLAMA_DEFAULT_MODEL: &str = "llama3.1";

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    max_context_tokens: usize,
    usage: TokenUsage,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaReply>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaReply {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

impl OllamaProvider {
    pub fn new(base_url: Option<&str>, model: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or(OLLAMA_DEFAULT_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or(OLLAMA_DEFAULT_MODEL).to_string(),
            timeout: Duration::from_secs(120),
            max_context_tokens: crate::llm::traits::DEFAULT_MAX_CONTEXT_TOKENS,
            usage: TokenUsage::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    async fn fetch_tags(&self) -> Result<Vec<String>, LlmError> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), &body));
        }
        let tags: OllamaTags = resp.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn id(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let options = (request.temperature.is_some() || request.max_tokens.is_some()).then(|| {
            OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            }
        });
        let body = OllamaChatRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: false,
            options,
        };

        let parsed: OllamaChatResponse = guarded_call(self.timeout, request.cancel.as_ref(), async {
            let resp = self
                .http
                .post(format!("{}/api/chat", self.base_url))
                .json(&body)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(LlmError::from_status(status.as_u16(), &text));
            }
            Ok(resp.json::<OllamaChatResponse>().await?)
        })
        .await?;

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (None, None) => None,
            (p, c) => Some(Usage {
                prompt_tokens: p.unwrap_or(0),
                completion_tokens: c.unwrap_or(0),
            }),
        };
        if let Some(u) = usage {
            self.usage.add(u.prompt_tokens, u.completion_tokens);
        }

        Ok(ChatResponse {
            content: parsed.message.map(|m| m.content).unwrap_or_default(),
            provider: "ollama".to_string(),
            model: model.to_string(),
            finish_reason: parsed.done_reason,
            usage,
        })
    }

    async fn is_available(&self) -> bool {
        match self.fetch_tags().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(provider = "ollama", error = %e, "health check failed");
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        self.fetch_tags().await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
