//! 对话层：对话实体与状态机驱动的对话管理器

pub mod manager;
pub mod types;

pub use manager::{is_ready_for_plan, ConversationManager, READINESS_CHAR_THRESHOLD, READINESS_PHRASES};
pub use types::{default_title, Conversation, TurnOutcome};
