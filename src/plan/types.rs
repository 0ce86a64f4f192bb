//! 阶段计划数据模型
//!
//! PhasePlan → Phase → PhaseTask。JSON 字段名为 camelCase，状态为 kebab-case，
//! 序列化与反序列化无损。`total_phases` 始终等于 `phases.len()`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 阶段复杂度
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// 工时估算权重（小时）
    pub fn weight_hours(self) -> u32 {
        match self {
            Complexity::Low => 2,
            Complexity::Medium => 4,
            Complexity::High => 8,
        }
    }

    /// 宽松解析，未知值回落到 Medium
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" | "easy" | "simple" => Complexity::Low,
            "high" | "hard" | "complex" => Complexity::High,
            _ => Complexity::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Verified,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in-progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Verified => "verified",
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Verified)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
        }
    }
}

/// 阶段内的任务
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTask {
    pub id: String,
    pub title: String,
    pub goal: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
}

/// 阶段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: String,
    pub title: String,
    pub description: String,
    pub order: u32,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<PhaseTask>,
    #[serde(default)]
    pub status: PhaseStatus,
}

impl Phase {
    pub fn all_tasks_completed(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }
}

/// 计划级整体复杂度（按阶段数分档）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanComplexity {
    #[default]
    Simple,
    Moderate,
    Complex,
    Enterprise,
}

impl PlanComplexity {
    pub fn from_phase_count(count: usize) -> Self {
        match count {
            0..=10 => PlanComplexity::Simple,
            11..=50 => PlanComplexity::Moderate,
            51..=200 => PlanComplexity::Complex,
            _ => PlanComplexity::Enterprise,
        }
    }
}

/// 闭区间 [min, max]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRange {
    pub min: usize,
    pub max: usize,
}

impl PhaseRange {
    pub fn contains(&self, n: usize) -> bool {
        n >= self.min && n <= self.max
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    /// 按复杂度加权的估算工时
    pub estimated_hours: u32,
    pub complexity: PlanComplexity,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_range: Option<PhaseRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
}

/// 完整的阶段计划
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhasePlan {
    pub id: String,
    /// 所属对话（按 id 反向引用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub title: String,
    pub description: String,
    pub phases: Vec<Phase>,
    pub total_phases: usize,
    #[serde(default)]
    pub metadata: PlanMetadata,
    pub created_at: DateTime<Utc>,
}

impl PhasePlan {
    pub fn new(title: impl Into<String>, description: impl Into<String>, phases: Vec<Phase>) -> Self {
        let total_phases = phases.len();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: None,
            title: title.into(),
            description: description.into(),
            phases,
            total_phases,
            metadata: PlanMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn sync_total_phases(&mut self) {
        self.total_phases = self.phases.len();
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_mut(&mut self, id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == id)
    }

    pub fn task_mut(&mut self, phase_id: &str, task_id: &str) -> Option<&mut PhaseTask> {
        self.phase_mut(phase_id)?
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
    }

    pub fn total_task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    pub fn completed_task_count(&self) -> usize {
        self.phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    /// 修改任务状态并汇总到阶段：全部完成 → Completed，有进行中 → InProgress；Verified 阶段不回退
    pub fn set_task_status(&mut self, phase_id: &str, task_id: &str, status: TaskStatus) -> bool {
        let Some(phase) = self.phase_mut(phase_id) else {
            return false;
        };
        let Some(task) = phase.tasks.iter_mut().find(|t| t.id == task_id) else {
            return false;
        };
        task.status = status;

        if phase.status == PhaseStatus::Verified {
            return true;
        }
        if phase.all_tasks_completed() {
            phase.status = PhaseStatus::Completed;
        } else if phase.tasks.iter().any(|t| t.status != TaskStatus::Pending) {
            phase.status = PhaseStatus::InProgress;
        } else {
            phase.status = PhaseStatus::Pending;
        }
        true
    }

    /// 标记任务完成；返回该阶段是否因此变为完成
    pub fn mark_task_completed(&mut self, phase_id: &str, task_id: &str) -> bool {
        let was_done = self.phase(phase_id).map(|p| p.status.is_done()).unwrap_or(false);
        if !self.set_task_status(phase_id, task_id, TaskStatus::Completed) {
            return false;
        }
        let now_done = self.phase(phase_id).map(|p| p.status.is_done()).unwrap_or(false);
        !was_done && now_done
    }

    pub fn set_phase_status(&mut self, phase_id: &str, status: PhaseStatus) -> bool {
        match self.phase_mut(phase_id) {
            Some(phase) => {
                phase.status = status;
                true
            }
            None => false,
        }
    }
}
