//! Prompt 模板：内置模板包与渲染引擎

pub mod defaults;
pub mod engine;

pub use engine::{PromptEngine, PromptTemplate};
