//! LLM 层：Provider 抽象与实现（Ollama / OpenAI 兼容 / DeepSeek / Mock）及回退注册表

pub mod deepseek;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod traits;

pub use deepseek::{create_deepseek_provider, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use registry::{ProviderHealth, ProviderRegistry};
pub use traits::{
    guarded_call, ChatProvider, ChatRequest, ChatResponse, ChatStream, StreamChunk, TokenUsage,
    Usage, DEFAULT_MAX_CONTEXT_TOKENS,
};
