//! 对话状态机：ConversationState 与合法迁移表
//!
//! 每个对话同一时刻只处于一个状态；迁移必须落在 `can_transition_to` 的白名单内，
//! ERROR 只能通过外部 reset 离开。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 对话所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    #[default]
    Idle,
    GatheringRequirements,
    AnalyzingRequirements,
    GeneratingPhases,
    Complete,
    Error,
}

impl ConversationState {
    /// 单步迁移是否合法（reset 不走这里）
    pub fn can_transition_to(self, to: ConversationState) -> bool {
        use ConversationState::*;
        match (self, to) {
            (Idle, GatheringRequirements) => true,
            (GatheringRequirements, GatheringRequirements) => true,
            (GatheringRequirements, AnalyzingRequirements) => true,
            (AnalyzingRequirements, GeneratingPhases) => true,
            // 规划被取消时退回收集阶段
            (AnalyzingRequirements, GatheringRequirements) => true,
            (GeneratingPhases, GatheringRequirements) => true,
            (GeneratingPhases, Complete) => true,
            (Complete, Complete) => true,
            (Error, _) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    /// 是否为需要外部介入的终止状态
    pub fn is_terminal_error(self) -> bool {
        matches!(self, ConversationState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationState::Idle => "IDLE",
            ConversationState::GatheringRequirements => "GATHERING_REQUIREMENTS",
            ConversationState::AnalyzingRequirements => "ANALYZING_REQUIREMENTS",
            ConversationState::GeneratingPhases => "GENERATING_PHASES",
            ConversationState::Complete => "COMPLETE",
            ConversationState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
