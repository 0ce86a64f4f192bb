//! 引擎构建器：按 Provider 注册表 → 计划生成器 / 上下文预算 → 对话管理器 → 自主循环 的顺序组装
//!
//! 所有服务对象显式构造、按 Arc 传递，没有全局注册表。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::autonomous::AutonomousLoop;
use crate::config::{load_config, AppConfig};
use crate::conversation::ConversationManager;
use crate::core::events::EventSender;
use crate::core::PromptError;
use crate::llm::{create_deepseek_provider, OllamaProvider, OpenAiProvider, ProviderRegistry};
use crate::memory::{ContextBudgetManager, ConversationStore, DebouncedSaver, JsonFileStore};
use crate::plan::PhasePlanGenerator;
use crate::prompts::PromptEngine;

/// 组装完成的引擎
pub struct Engine {
    pub config: AppConfig,
    pub registry: Arc<ProviderRegistry>,
    pub prompts: Arc<PromptEngine>,
    pub generator: Arc<PhasePlanGenerator>,
    pub conversations: Arc<ConversationManager>,
    pub autonomous: Arc<AutonomousLoop>,
}

pub struct EngineBuilder {
    config: AppConfig,
    registry: Option<ProviderRegistry>,
    store: Option<Arc<dyn ConversationStore>>,
    events: Option<EventSender>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            store: None,
            events: None,
        }
    }

    /// 使用外部构造的注册表（测试、离线运行）；重试策略仍取自配置
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 覆盖默认的 JSON 文件存储
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// 按配置注册启用的 Provider；云端 Provider 缺少 API Key 时跳过
    pub fn build_registry(&self) -> ProviderRegistry {
        let llm = &self.config.llm;
        let mut registry = ProviderRegistry::new()
            .with_priority(llm.priority.iter().cloned())
            .with_health_ttl(Duration::from_secs(llm.health_ttl_secs));

        if llm.ollama.enabled {
            let mut provider = OllamaProvider::new(llm.ollama.base_url.as_deref(), llm.ollama.model.as_deref())
                .with_timeout(llm.ollama.timeout(llm.request_timeout_secs));
            if let Some(tokens) = llm.ollama.max_context_tokens {
                provider = provider.with_max_context_tokens(tokens);
            }
            registry.register(Arc::new(provider));
        }

        if llm.openai.enabled {
            match llm.openai.api_key() {
                Some(key) => {
                    let model = llm.openai.model.as_deref().unwrap_or(crate::llm::openai::OPENAI_DEFAULT_MODEL);
                    let mut provider = OpenAiProvider::new(llm.openai.base_url.as_deref(), model, Some(key.as_str()))
                        .with_timeout(llm.openai.timeout(llm.request_timeout_secs));
                    if let Some(tokens) = llm.openai.max_context_tokens {
                        provider = provider.with_max_context_tokens(tokens);
                    }
                    registry.register(Arc::new(provider));
                }
                None => tracing::debug!("openai enabled but no API key found, skipping"),
            }
        }

        if llm.deepseek.enabled {
            match llm.deepseek.api_key() {
                Some(key) => {
                    let mut provider = create_deepseek_provider(
                        llm.deepseek.base_url.as_deref(),
                        llm.deepseek.model.as_deref(),
                        Some(key.as_str()),
                    )
                    .with_timeout(llm.deepseek.timeout(llm.request_timeout_secs));
                    if let Some(tokens) = llm.deepseek.max_context_tokens {
                        provider = provider.with_max_context_tokens(tokens);
                    }
                    registry.register(Arc::new(provider));
                }
                None => tracing::debug!("deepseek enabled but no API key found, skipping"),
            }
        }

        registry
    }

    fn build_prompts(&self) -> Result<PromptEngine, PromptError> {
        let mut prompts = PromptEngine::with_defaults();
        if let Some(path) = &self.config.prompts.overrides {
            prompts.apply_overrides_file(path)?;
        }
        Ok(prompts)
    }

    pub fn build(mut self) -> Result<Engine, PromptError> {
        let prompts = Arc::new(self.build_prompts()?);
        let registry = match self.registry.take() {
            Some(external) => external,
            None => self.build_registry(),
        };
        let registry = Arc::new(registry.with_retry(self.config.retry.to_options()));
        if registry.is_empty() {
            tracing::warn!("no LLM providers registered; every request will fail");
        }
        tracing::info!(providers = ?registry.ordered_ids(), "provider registry ready");

        let generator = Arc::new(
            PhasePlanGenerator::new(registry.clone(), prompts.clone())
                .with_temperature(Some(self.config.planning.temperature)),
        );
        let context = ContextBudgetManager::new(self.config.context.to_config());

        let mut manager =
            ConversationManager::new(registry.clone(), prompts.clone(), generator.clone(), context.clone());
        if self.config.persistence.enabled {
            let store = self
                .store
                .unwrap_or_else(|| Arc::new(JsonFileStore::new(&self.config.app.data_dir)));
            manager = manager.with_saver(DebouncedSaver::new(
                store,
                Duration::from_millis(self.config.persistence.debounce_ms),
            ));
        }
        let mut autonomous = AutonomousLoop::new(
            registry.clone(),
            prompts.clone(),
            generator.clone(),
            self.config.autonomous.to_config(),
        )
        .with_context(context);
        if let Some(events) = self.events {
            manager = manager.with_events(events.clone());
            autonomous = autonomous.with_events(events);
        }

        Ok(Engine {
            config: self.config,
            registry,
            prompts,
            generator,
            conversations: Arc::new(manager),
            autonomous: Arc::new(autonomous),
        })
    }
}

/// 加载配置并创建构建器；配置加载失败时回退到默认配置
pub fn create_engine_builder(config_path: Option<PathBuf>) -> EngineBuilder {
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });
    EngineBuilder::new(config)
}
