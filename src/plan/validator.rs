//! 计划校验与规范化
//!
//! 原始计划必须满足全部约束才会被接受：标题与描述非空、阶段数在 [1, 1000] 且落在预估范围内、
//! 每个阶段有标题与描述、阶段 id 唯一、依赖全部可解析且不自引用。
//! 通过后补全缺省字段（id、order、复杂度、任务 id），所有阶段与任务初始化为 pending。
//! 依赖环不在此拒绝，由 graph 模块分析并报告。

use std::collections::HashSet;

use crate::plan::complexity::MAX_PHASES;
use crate::plan::parser::{RawPhase, RawPlan, RawTask};
use crate::plan::types::{
    Complexity, Phase, PhasePlan, PhaseRange, PhaseStatus, PhaseTask, TaskStatus,
};

fn non_blank(s: &Option<String>) -> Option<String> {
    s.as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn phase_id_for(index: usize) -> String {
    format!("phase-{:03}", index + 1)
}

fn normalize_task(phase_id: &str, index: usize, raw: &RawTask, errors: &mut Vec<String>) -> PhaseTask {
    let title = non_blank(&raw.title);
    let goal = non_blank(&raw.goal);
    if title.is_none() && goal.is_none() {
        errors.push(format!("{}: task {} has neither title nor goal", phase_id, index + 1));
    }
    PhaseTask {
        id: non_blank(&raw.id).unwrap_or_else(|| format!("{}-task-{:02}", phase_id, index + 1)),
        title: title.clone().or_else(|| goal.clone()).unwrap_or_default(),
        goal: goal.or(title).unwrap_or_default(),
        files: raw.files.clone(),
        instructions: raw.instructions.clone(),
        acceptance_criteria: raw.acceptance_criteria.clone(),
        status: TaskStatus::Pending,
    }
}

/// 把依赖引用解析为阶段 id：已知 id 原样保留，数字按 1 起的序号映射
fn resolve_dependency(value: &serde_json::Value, ids: &[String]) -> Option<String> {
    let by_index = |n: u64| -> Option<String> {
        let n = usize::try_from(n).ok()?;
        (n >= 1 && n <= ids.len()).then(|| ids[n - 1].clone())
    };
    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if ids.iter().any(|id| id == s) {
                Some(s.to_string())
            } else {
                s.parse::<u64>().ok().and_then(by_index)
            }
        }
        serde_json::Value::Number(n) => n.as_u64().and_then(by_index),
        _ => None,
    }
}

/// 校验并规范化；失败时返回全部违规描述
pub fn validate_and_normalize(raw: &RawPlan, range: PhaseRange) -> Result<PhasePlan, Vec<String>> {
    let mut errors = Vec::new();

    let title = non_blank(&raw.title);
    let description = non_blank(&raw.description);
    if title.is_none() {
        errors.push("plan title is missing".to_string());
    }
    if description.is_none() {
        errors.push("plan description is missing".to_string());
    }

    let count = raw.phases.len();
    if count == 0 {
        errors.push("plan has no phases".to_string());
    } else if count > MAX_PHASES {
        errors.push(format!("plan has {} phases, more than the limit of {}", count, MAX_PHASES));
    }
    if count > 0 && !range.contains(count) {
        errors.push(format!(
            "plan has {} phases, expected between {} and {}",
            count, range.min, range.max
        ));
    }

    let ids: Vec<String> = raw
        .phases
        .iter()
        .enumerate()
        .map(|(i, p)| non_blank(&p.id).unwrap_or_else(|| phase_id_for(i)))
        .collect();

    let mut seen = HashSet::new();
    for id in &ids {
        if !seen.insert(id.as_str()) {
            errors.push(format!("duplicate phase id {}", id));
        }
    }

    let mut phases = Vec::with_capacity(count);
    for (i, (rp, id)) in raw.phases.iter().zip(ids.iter()).enumerate() {
        phases.push(normalize_phase(i, id, rp, &ids, &mut errors));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    phases.sort_by_key(|p| p.order);
    let mut plan = PhasePlan::new(
        title.unwrap_or_default(),
        description.unwrap_or_default(),
        phases,
    );
    plan.metadata.phase_range = Some(range);
    plan.sync_total_phases();
    Ok(plan)
}

fn normalize_phase(
    index: usize,
    id: &str,
    raw: &RawPhase,
    ids: &[String],
    errors: &mut Vec<String>,
) -> Phase {
    let title = non_blank(&raw.title);
    let description = non_blank(&raw.description);
    if title.is_none() {
        errors.push(format!("{}: title is missing", id));
    }
    if description.is_none() {
        errors.push(format!("{}: description is missing", id));
    }

    let mut dependencies = Vec::new();
    for dep in &raw.dependencies {
        match resolve_dependency(dep, ids) {
            Some(dep_id) if dep_id == id => errors.push(format!("{}: depends on itself", id)),
            Some(dep_id) => {
                if !dependencies.contains(&dep_id) {
                    dependencies.push(dep_id);
                }
            }
            None => errors.push(format!("{}: unknown dependency {}", id, dep)),
        }
    }

    let tasks = raw
        .tasks
        .iter()
        .enumerate()
        .map(|(ti, t)| normalize_task(id, ti, t, errors))
        .collect();

    Phase {
        id: id.to_string(),
        title: title.unwrap_or_default(),
        description: description.unwrap_or_default(),
        order: raw.order.unwrap_or(index as u32 + 1),
        complexity: raw
            .complexity
            .as_deref()
            .map(Complexity::parse_lenient)
            .unwrap_or_default(),
        dependencies,
        tags: raw.tags.clone(),
        files: raw.files.clone(),
        tasks,
        status: PhaseStatus::Pending,
    }
}

/// 已结构化计划的不变量检查（生成后或加载后使用）
pub fn check_invariants(plan: &PhasePlan) -> Vec<String> {
    let mut issues = Vec::new();
    if plan.total_phases != plan.phases.len() {
        issues.push(format!(
            "totalPhases is {} but plan has {} phases",
            plan.total_phases,
            plan.phases.len()
        ));
    }
    let mut seen = HashSet::new();
    for phase in &plan.phases {
        if !seen.insert(phase.id.as_str()) {
            issues.push(format!("duplicate phase id {}", phase.id));
        }
    }
    for phase in &plan.phases {
        for dep in &phase.dependencies {
            if dep == &phase.id {
                issues.push(format!("{}: depends on itself", phase.id));
            } else if !seen.contains(dep.as_str()) {
                issues.push(format!("{}: unknown dependency {}", phase.id, dep));
            }
        }
    }
    issues
}

/// 任务完整性检查：每个任务都要有标题与目标
pub fn task_issues(plan: &PhasePlan) -> Vec<String> {
    plan.phases
        .iter()
        .flat_map(|p| {
            p.tasks.iter().filter_map(move |t| {
                if t.title.trim().is_empty() || t.goal.trim().is_empty() {
                    Some(format!("{}/{}: task needs both a title and a goal", p.id, t.id))
                } else {
                    None
                }
            })
        })
        .collect()
}
