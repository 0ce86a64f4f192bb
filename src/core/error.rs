//! 错误类型与分类
//!
//! LlmError 是 Provider 层的统一错误分类（网络 / 超时 / 限流 / 非法请求 / 服务端 / 取消），
//! 重试执行器与 Provider 回退链都只依据 `is_retryable()` 与 `Cancelled` 做决策。

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Provider 调用可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// 请求本身有问题（参数、凭据），重试无意义
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 服务端错误（5xx）或无法识别的错误
    #[error("API error: {message}")]
    Api { message: String, status: Option<u16> },

    #[error("Operation cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
            status: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// 网络、超时、限流、服务端错误可重试；非法请求与取消不可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_)
            | LlmError::Timeout(_)
            | LlmError::RateLimited { .. }
            | LlmError::Api { .. } => true,
            LlmError::InvalidRequest(_) | LlmError::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled)
    }

    /// 按 HTTP 状态码分类：429 → RateLimited，其余 4xx → InvalidRequest，5xx 及其它 → Api
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => LlmError::RateLimited {
                message: body.to_string(),
                retry_after_ms: None,
            },
            400..=499 => LlmError::InvalidRequest(format!("HTTP {}: {}", status, body)),
            _ => LlmError::Api {
                message: body.to_string(),
                status: Some(status),
            },
        }
    }

    /// 从 SDK 的错误文本分类：能找到 HTTP 状态码时按状态码，否则识别超时/网络关键词，兜底为 Api
    pub fn from_message(msg: &str) -> Self {
        if let Some(status) = extract_status_code(msg) {
            return Self::from_status(status, msg);
        }
        let lower = msg.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout(msg.to_string())
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            LlmError::rate_limited(msg)
        } else if lower.contains("connection")
            || lower.contains("network")
            || lower.contains("dns")
            || lower.contains("error sending request")
        {
            LlmError::Network(msg.to_string())
        } else {
            LlmError::api(msg)
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return LlmError::Timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            return LlmError::from_status(status.as_u16(), &err.to_string());
        }
        if err.is_connect() || err.is_request() {
            return LlmError::Network(err.to_string());
        }
        LlmError::from_message(&err.to_string())
    }
}

fn status_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:status(?:\s*code)?|http)[\s:=]*([1-5]\d{2})\b").expect("valid regex")
    })
}

/// 形如 "status: 503" / "HTTP 429" 的文本中提取状态码
fn extract_status_code(msg: &str) -> Option<u16> {
    status_regex()
        .captures(msg)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|s| *s >= 400)
}

/// 计划生成错误
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 两次尝试（含一次纠正重试）后仍无法得到合法计划
    #[error("could not produce a valid plan: {0}")]
    InvalidPlan(String),

    #[error("no requirements text to plan from")]
    NoRequirements,

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),
}

/// Prompt 模板错误
#[derive(Error, Debug)]
pub enum PromptError {
    #[error("Unknown prompt template: {0}")]
    UnknownTemplate(String),

    #[error("Template '{template}' is missing variable '{variable}'")]
    MissingVariable { template: String, variable: String },

    #[error("Failed to load prompt templates: {0}")]
    Load(String),
}

/// 持久化错误
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// 对话状态机错误
#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Conversation is in ERROR state; reset or start a new conversation")]
    Errored,

    #[error("No plan available for conversation {0}")]
    NoPlan(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Plan generation failed: {0}")]
    Plan(#[from] PlanError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// 自主执行循环启动阶段的错误（迭代中的错误通过完成事件上报，不会抛出）
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Loop is already running")]
    AlreadyRunning,

    #[error("Plan generation failed: {0}")]
    Plan(#[from] PlanError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),
}
