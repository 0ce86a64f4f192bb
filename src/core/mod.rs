//! 核心层：错误类型、对话状态机、重试、事件与引擎组装

pub mod builder;
pub mod error;
pub mod events;
pub mod retry;
pub mod state;

pub use builder::{create_engine_builder, Engine, EngineBuilder};
pub use error::{
    ConversationError, LlmError, LoopError, PersistenceError, PlanError, PromptError,
};
pub use events::{send_event, EngineEvent, EventSender};
pub use retry::{retry_with_backoff, RetryOptions};
pub use state::ConversationState;
