//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PLANLOOM__*` 覆盖（双下划线表示嵌套，如 `PLANLOOM__LLM__OPENAI__MODEL=gpt-4o`）。
//! 每个字段都有默认值，缺少配置文件时 `AppConfig::default()` 即可运行。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::autonomous::{LoopConfig, VerificationPolicy};
use crate::core::retry::RetryOptions;
use crate::memory::ContextConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub context: ContextSection,
    pub planning: PlanningSection,
    pub autonomous: AutonomousSection,
    pub persistence: PersistenceSection,
    pub prompts: PromptsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 对话与计划文件目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_app_name() -> String {
    "planloom".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

/// [llm] 段：Provider 优先级、统一超时与各 Provider 子段
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_priority")]
    pub priority: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 健康探测缓存时长（秒）
    #[serde(default = "default_health_ttl_secs")]
    pub health_ttl_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_ollama")]
    pub ollama: ProviderSection,
    #[serde(default = "default_openai")]
    pub openai: ProviderSection,
    #[serde(default = "default_deepseek")]
    pub deepseek: ProviderSection,
}

fn default_priority() -> Vec<String> {
    vec!["ollama".into(), "openai".into(), "deepseek".into()]
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_health_ttl_secs() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            request_timeout_secs: default_request_timeout_secs(),
            health_ttl_secs: default_health_ttl_secs(),
            temperature: default_temperature(),
            ollama: default_ollama(),
            openai: default_openai(),
            deepseek: default_deepseek(),
        }
    }
}

/// [llm.<provider>] 子段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderSection {
    #[serde(default)]
    pub enabled: bool,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: Option<String>,
    pub max_context_tokens: Option<usize>,
    /// 覆盖 llm.request_timeout_secs
    pub timeout_secs: Option<u64>,
}

impl ProviderSection {
    /// 从 api_key_env 指定的环境变量读取 Key
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn timeout(&self, fallback_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(fallback_secs))
    }
}

fn default_ollama() -> ProviderSection {
    ProviderSection {
        enabled: true,
        model: Some("llama3.1".into()),
        base_url: Some("http://localhost:11434".into()),
        api_key_env: None,
        max_context_tokens: Some(8192),
        timeout_secs: Some(120),
    }
}

fn default_openai() -> ProviderSection {
    ProviderSection {
        enabled: true,
        model: Some("gpt-4o-mini".into()),
        base_url: None,
        api_key_env: Some("OPENAI_API_KEY".into()),
        max_context_tokens: None,
        timeout_secs: None,
    }
}

fn default_deepseek() -> ProviderSection {
    ProviderSection {
        enabled: true,
        model: Some("deepseek-chat".into()),
        base_url: None,
        api_key_env: Some("DEEPSEEK_API_KEY".into()),
        max_context_tokens: None,
        timeout_secs: None,
    }
}

/// [retry] 段：单个 Provider 内的指数退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: true,
        }
    }
}

impl RetrySection {
    pub fn to_options(&self) -> RetryOptions {
        RetryOptions::new(self.max_retries)
            .with_delays(
                Duration::from_millis(self.initial_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
            .with_backoff_factor(self.backoff_factor)
            .with_jitter(self.jitter)
    }
}

/// [context] 段：上下文预算
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_trigger_ratio() -> f64 {
    0.7
}

fn default_window_size() -> usize {
    10
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            trigger_ratio: default_trigger_ratio(),
            window_size: default_window_size(),
        }
    }
}

impl ContextSection {
    pub fn to_config(&self) -> ContextConfig {
        ContextConfig {
            trigger_ratio: self.trigger_ratio,
            window_size: self.window_size,
        }
    }
}

/// [planning] 段
#[derive(Debug, Clone, Deserialize)]
pub struct PlanningSection {
    /// 计划生成请求使用的温度
    #[serde(default = "default_plan_temperature")]
    pub temperature: f32,
}

fn default_plan_temperature() -> f32 {
    0.2
}

impl Default for PlanningSection {
    fn default() -> Self {
        Self {
            temperature: default_plan_temperature(),
        }
    }
}

/// [autonomous] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AutonomousSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub verification: VerificationPolicy,
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u8,
}

fn default_max_iterations() -> usize {
    50
}

fn default_pause_poll_ms() -> u64 {
    500
}

fn default_confidence_threshold() -> u8 {
    30
}

impl Default for AutonomousSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            verification: VerificationPolicy::default(),
            pause_poll_ms: default_pause_poll_ms(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl AutonomousSection {
    pub fn to_config(&self) -> LoopConfig {
        LoopConfig {
            max_iterations: self.max_iterations,
            verification: self.verification,
            pause_poll_interval: Duration::from_millis(self.pause_poll_ms),
            confidence_threshold: self.confidence_threshold,
        }
    }
}

/// [persistence] 段
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// [prompts] 段：模板覆盖文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PromptsSection {
    pub overrides: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 PLANLOOM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PLANLOOM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PLANLOOM")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.priority, vec!["ollama", "openai", "deepseek"]);
        assert_eq!(cfg.context.trigger_ratio, 0.7);
        assert_eq!(cfg.context.window_size, 10);
        assert_eq!(cfg.autonomous.confidence_threshold, 30);
        assert_eq!(cfg.autonomous.verification, VerificationPolicy::Lenient);
        assert_eq!(cfg.retry.to_options().max_retries, 3);
        assert!(cfg.llm.ollama.enabled);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[llm]
priority = ["openai"]

[llm.openai]
enabled = true
model = "gpt-4o"
max_context_tokens = 64000

[autonomous]
verification = "strict"
max_iterations = 7
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.priority, vec!["openai"]);
        assert_eq!(cfg.llm.openai.model.as_deref(), Some("gpt-4o"));
        assert_eq!(cfg.llm.openai.max_context_tokens, Some(64000));
        assert_eq!(cfg.autonomous.verification, VerificationPolicy::Strict);
        assert_eq!(cfg.autonomous.max_iterations, 7);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.autonomous.to_config().pause_poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_provider_timeout_fallback() {
        let section = ProviderSection::default();
        assert_eq!(section.timeout(60), Duration::from_secs(60));
        assert!(section.api_key().is_none());
    }
}
