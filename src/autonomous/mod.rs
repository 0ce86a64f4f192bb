//! 自主执行循环：置信度门控、失败日志自我纠正、连击与成就

pub mod engine;
pub mod executor;
pub mod loop_;
pub mod types;

pub use engine::LoopEngine;
pub use executor::{parse_confidence, verify, TaskExecutor, Verdict};
pub use loop_::{ensure_tasks, AutonomousLoop, LoopControl};
pub use types::{
    Achievement, FailureJournalEntry, LoopConfig, LoopReport, LoopStatus, VerificationPolicy,
    COMPLETION_MARKER, FAILURE_MARKER,
};
