//! 记忆层：对话消息、上下文预算、持久化

pub mod conversation;
pub mod persistence;
pub mod token_budget;

pub use conversation::{Message, MessageMetadata, Role};
pub use persistence::{save_snapshot, ConversationStore, DebouncedSaver, InMemoryStore, JsonFileStore};
pub use token_budget::{
    summarize_messages, BudgetOutcome, ContextBudgetManager, ContextConfig, ContextState,
    TokenEstimator,
};
