//! Planloom - 需求对话与阶段计划引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、对话状态机、重试退避、事件、引擎组装
//! - **llm**: Provider 抽象与实现（Ollama / OpenAI 兼容 / DeepSeek / Mock）及回退注册表
//! - **memory**: 消息模型、上下文预算、防抖持久化
//! - **prompts**: Prompt 模板注册与渲染
//! - **plan**: 阶段计划的生成、解析、校验、依赖图与导出
//! - **conversation**: 需求收集对话管理
//! - **autonomous**: 自主执行循环（置信度门控、失败日志、连击）

pub mod autonomous;
pub mod config;
pub mod conversation;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod prompts;

pub use crate::core::{create_engine_builder, Engine, EngineBuilder};
