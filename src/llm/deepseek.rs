//! DeepSeek Provider（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use crate::llm::OpenAiProvider;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";
pub const DEEPSEEK_MAX_CONTEXT_TOKENS: usize = 64_000;

/// 创建 DeepSeek Provider
///
/// - api_key 未给出时读环境变量 `DEEPSEEK_API_KEY`
/// - 模型可通过 `model` 参数或 `DEEPSEEK_MODEL` 环境变量指定，默认 `deepseek-chat`
pub fn create_deepseek_provider(
    base_url: Option<&str>,
    model: Option<&str>,
    api_key: Option<&str>,
) -> OpenAiProvider {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
        .unwrap_or_default();

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    OpenAiProvider::new(
        Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)),
        &model,
        Some(api_key.as_str()),
    )
    .with_id("deepseek")
    .with_max_context_tokens(DEEPSEEK_MAX_CONTEXT_TOKENS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatProvider;

    #[test]
    fn test_deepseek_identity() {
        let p = create_deepseek_provider(None, Some(DEEPSEEK_REASONER), Some("k"));
        assert_eq!(p.id(), "deepseek");
        assert_eq!(p.model(), DEEPSEEK_REASONER);
        assert_eq!(p.max_context_tokens(), DEEPSEEK_MAX_CONTEXT_TOKENS);
    }
}
