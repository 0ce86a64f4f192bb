//! 对话实体与单轮结果

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::ConversationState;
use crate::memory::{ContextState, Message, Role};
use crate::plan::PhasePlan;

pub const TITLE_MAX_CHARS: usize = 60;

/// 一次对话：元数据 + 有序消息 + 上下文摘要状态 + 至多一个计划
///
/// 计划通过存储层单独读写（按对话 id），序列化对话时不内联。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_count: Option<usize>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub context: ContextState,
    #[serde(skip)]
    pub plan: Option<PhasePlan>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            state: ConversationState::Idle,
            created_at: now,
            updated_at: now,
            requirements_summary: None,
            phase_count: None,
            messages: Vec::new(),
            context: ContextState::default(),
            plan: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role == Role::User)
    }

    pub fn user_turns(&self) -> usize {
        self.user_messages().count()
    }

    /// 所有用户轮次的字符总数
    pub fn user_chars(&self) -> usize {
        self.user_messages().map(|m| m.content.chars().count()).sum()
    }

    /// 对话文本（跳过系统提示），用于需求分析
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System || m.is_summary())
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn set_plan(&mut self, plan: PhasePlan) {
        self.phase_count = Some(plan.total_phases);
        self.plan = Some(plan);
    }
}

/// 从首条用户消息截取默认标题
pub fn default_title(first_turn: &str) -> String {
    let line = first_turn.trim().lines().next().unwrap_or_default();
    line.chars().take(TITLE_MAX_CHARS).collect::<String>().trim_end().to_string()
}

/// 单轮对话的结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub state: ConversationState,
    pub plan_generated: bool,
}
