//! 对话消息
//!
//! Message 带有可选元数据：token 估算缓存、摘要标记、系统提示标记及其模板 id。
//! 上下文预算管理器依赖这些标记在裁剪后重新注入系统提示。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// 消息元数据
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// 估算 token 数缓存，内容不变时无需重算
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    #[serde(default)]
    pub is_summary: bool,
    #[serde(default)]
    pub is_system_prompt: bool,
    /// 渲染该系统提示所用的模板 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// 由模板渲染出的系统提示，裁剪后按 template_id 重新注入
    pub fn system_prompt(template_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::system(content);
        msg.metadata.is_system_prompt = true;
        msg.metadata.template_id = Some(template_id.into());
        msg
    }

    /// 历史摘要消息
    pub fn summary(content: impl Into<String>) -> Self {
        let mut msg = Self::system(content);
        msg.metadata.is_summary = true;
        msg
    }

    pub fn is_system_prompt(&self) -> bool {
        self.metadata.is_system_prompt
    }

    pub fn is_summary(&self) -> bool {
        self.metadata.is_summary
    }
}
