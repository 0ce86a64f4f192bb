//! 计划导出：无损 JSON 与确定性 Markdown

use std::fmt::Write as _;

use crate::plan::types::{PhasePlan, TaskStatus};

pub fn to_json(plan: &PhasePlan) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(plan)
}

/// 反序列化后同步 totalPhases，保证不变量
pub fn from_json(json: &str) -> Result<PhasePlan, serde_json::Error> {
    let mut plan: PhasePlan = serde_json::from_str(json)?;
    plan.sync_total_phases();
    Ok(plan)
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// 同一计划总是得到同一份 Markdown（不含时间戳等易变字段）
pub fn to_markdown(plan: &PhasePlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", plan.title);
    if !plan.description.is_empty() {
        let _ = writeln!(out, "{}\n", plan.description);
    }

    let meta = &plan.metadata;
    let _ = writeln!(
        out,
        "**Phases:** {} | **Complexity:** {:?} | **Estimated hours:** {}",
        plan.total_phases, meta.complexity, meta.estimated_hours
    );
    if !meta.technologies.is_empty() {
        let _ = writeln!(out, "**Technologies:** {}", meta.technologies.join(", "));
    }
    out.push('\n');

    for phase in &plan.phases {
        let _ = writeln!(out, "## Phase {}: {}\n", phase.order, phase.title);
        let _ = writeln!(out, "- **ID:** `{}`", phase.id);
        let _ = writeln!(out, "- **Status:** {}", phase.status.as_str());
        let _ = writeln!(out, "- **Complexity:** {}", phase.complexity.as_str());
        let _ = writeln!(out, "- **Dependencies:** {}", join_or_none(&phase.dependencies));
        if !phase.tags.is_empty() {
            let _ = writeln!(out, "- **Tags:** {}", phase.tags.join(", "));
        }
        if !phase.files.is_empty() {
            let _ = writeln!(out, "- **Files:** {}", phase.files.join(", "));
        }
        let _ = writeln!(out, "\n{}\n", phase.description);

        if phase.tasks.is_empty() {
            continue;
        }
        let _ = writeln!(out, "### Tasks\n");
        for (i, task) in phase.tasks.iter().enumerate() {
            let done = task.status == TaskStatus::Completed;
            let _ = writeln!(out, "#### {}. {} (`{}`)\n", i + 1, task.title, task.id);
            let _ = writeln!(out, "- **Status:** {}", task.status.as_str());
            let _ = writeln!(out, "- **Goal:** {}", task.goal);
            if !task.files.is_empty() {
                let _ = writeln!(out, "- **Files:** {}", task.files.join(", "));
            }
            out.push('\n');
            if !task.instructions.is_empty() {
                let _ = writeln!(out, "**Instructions:**\n");
                for (n, step) in task.instructions.iter().enumerate() {
                    let _ = writeln!(out, "{}. {}", n + 1, step);
                }
                out.push('\n');
            }
            if !task.acceptance_criteria.is_empty() {
                let _ = writeln!(out, "**Acceptance criteria:**\n");
                let mark = if done { "x" } else { " " };
                for c in &task.acceptance_criteria {
                    let _ = writeln!(out, "- [{}] {}", mark, c);
                }
                out.push('\n');
            }
        }
    }

    out.trim_end().to_string() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::fixtures::{phase, task};
    use crate::plan::types::{PhasePlan, PlanComplexity};

    fn sample() -> PhasePlan {
        let mut plan = PhasePlan::new(
            "Todo App",
            "Todos with login",
            vec![
                phase("phase-001", 1, &[], vec![task("t1")]),
                phase("phase-002", 2, &["phase-001"], vec![]),
            ],
        );
        plan.metadata.complexity = PlanComplexity::Simple;
        plan.metadata.estimated_hours = 8;
        plan.metadata.technologies = vec!["react".into()];
        plan
    }

    #[test]
    fn test_json_round_trip_is_lossless() {
        let plan = sample();
        let back = from_json(&to_json(&plan).unwrap()).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_from_json_repairs_total() {
        let mut v = serde_json::to_value(sample()).unwrap();
        v["totalPhases"] = serde_json::json!(99);
        let plan = from_json(&v.to_string()).unwrap();
        assert_eq!(plan.total_phases, 2);
    }

    #[test]
    fn test_markdown_layout() {
        let mut plan = sample();
        plan.mark_task_completed("phase-001", "t1");
        let md = to_markdown(&plan);
        assert!(md.starts_with("# Todo App\n"));
        assert!(md.contains("## Phase 1: Phase phase-001"));
        assert!(md.contains("- **Status:** completed"));
        assert!(md.contains("- **Dependencies:** phase-001"));
        assert!(md.contains("- **Dependencies:** none"));
        assert!(md.contains("1. do it"));
        assert!(md.contains("- [x] it is done"));
        assert!(md.contains("**Technologies:** react"));
        assert_eq!(md, to_markdown(&plan));
    }
}
