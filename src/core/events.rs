//! 引擎事件：状态迁移、自主循环进度与完成，供 UI / 持久化协作方订阅
//!
//! 事件经 `mpsc::UnboundedSender` 投递；没有订阅方时静默丢弃。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::ConversationState;

/// 可序列化为 JSON 的引擎事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 对话状态迁移（包括 COMPLETE → COMPLETE 之类的自迁移）
    StateTransition {
        conversation_id: String,
        from_state: ConversationState,
        to_state: ConversationState,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// 计划生成或重新生成完成
    PlanGenerated {
        conversation_id: String,
        total_phases: usize,
    },
    /// 上下文被摘要压缩
    ContextSummarized {
        conversation_id: String,
        tokens_before: usize,
        tokens_after: usize,
    },
    /// 自主循环每轮进度
    Progress {
        iteration: usize,
        max_iterations: usize,
        completed_tasks: usize,
        total_tasks: usize,
        status: String,
        combo_multiplier: f64,
        achievements: Vec<String>,
    },
    /// 自主循环结束
    Completion {
        success: bool,
        iterations: usize,
        status: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// 有订阅方时发送事件，接收端关闭也不报错
pub fn send_event(tx: &Option<EventSender>, ev: EngineEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
