//! 阶段计划：数据模型、复杂度启发式、JSON 提取、校验、生成、依赖图分析与导出

pub mod complexity;
pub mod export;
pub mod generator;
pub mod graph;
pub mod parser;
pub mod types;
pub mod validator;

pub use complexity::{detect_technologies, phase_range, MAX_PHASES};
pub use export::{from_json, to_json, to_markdown};
pub use generator::{finalize_metadata, parse_plan, PhasePlanGenerator};
pub use graph::{analyze_plan, PhaseGraph, PlanAnalysis};
pub use types::{
    Complexity, Phase, PhasePlan, PhaseRange, PhaseStatus, PhaseTask, PlanComplexity, PlanMetadata,
    TaskStatus,
};
pub use validator::{check_invariants, task_issues, validate_and_normalize};
