//! 自主循环的数据类型

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::PhasePlan;

pub const COMPLETION_MARKER: &str = "TASK_COMPLETE";
pub const FAILURE_MARKER: &str = "TASK_FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Running,
    Paused,
    Completed,
    Stopped,
    /// 迭代次数用尽但仍有未完成任务
    Exhausted,
    Error,
}

impl LoopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopStatus::Running => "running",
            LoopStatus::Paused => "paused",
            LoopStatus::Completed => "completed",
            LoopStatus::Stopped => "stopped",
            LoopStatus::Exhausted => "exhausted",
            LoopStatus::Error => "error",
        }
    }
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 没有完成标记时如何判定
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationPolicy {
    /// 没有失败信号即视为成功（记 warn）
    #[default]
    Lenient,
    /// 必须出现完成标记
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Achievement {
    FirstTask,
    PhaseComplete,
    /// 连续 5 个任务成功
    Perfectionist,
    /// 失败后紧接着成功
    Comeback,
    /// 单次运行完成 10 个任务
    Marathon,
}

impl Achievement {
    pub fn as_str(self) -> &'static str {
        match self {
            Achievement::FirstTask => "first_task",
            Achievement::PhaseComplete => "phase_complete",
            Achievement::Perfectionist => "perfectionist",
            Achievement::Comeback => "comeback",
            Achievement::Marathon => "marathon",
        }
    }
}

/// 单个任务的一次失败记录；运行期间只追加不截断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureJournalEntry {
    pub iteration: usize,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
    pub verification: VerificationPolicy,
    /// 暂停时轮询恢复/停止的间隔
    pub pause_poll_interval: Duration,
    /// 低于该置信度的任务本轮跳过
    pub confidence_threshold: u8,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            verification: VerificationPolicy::Lenient,
            pause_poll_interval: Duration::from_millis(500),
            confidence_threshold: 30,
        }
    }
}

/// 一次运行的最终报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopReport {
    pub status: LoopStatus,
    pub iterations: usize,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    pub combo_multiplier: f64,
    pub achievements: Vec<String>,
    /// 任务键为 `<phase id>/<task id>`
    pub failure_journal: HashMap<String, Vec<FailureJournalEntry>>,
    pub plan: PhasePlan,
}

impl LoopReport {
    pub fn success(&self) -> bool {
        self.status == LoopStatus::Completed
    }
}
