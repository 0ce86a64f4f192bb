//! Prompt 模板引擎
//!
//! 模板以 id 注册；渲染时用 `{{name}}` 变量替换，缺失变量报 MissingVariable。
//! 内置模板可被 TOML 文件覆盖（`[templates.<id>] template = "..."`）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::core::PromptError;
use crate::memory::Message;
use crate::prompts::defaults::DEFAULT_TEMPLATES;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid regex"))
}

/// 单个模板
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub id: String,
    pub description: String,
    pub template: String,
}

impl PromptTemplate {
    pub fn new(id: impl Into<String>, description: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            template: template.into(),
        }
    }

    /// 模板中出现的变量名（去重，按出现顺序）
    pub fn variables(&self) -> Vec<String> {
        let mut vars: Vec<String> = Vec::new();
        for cap in placeholder_regex().captures_iter(&self.template) {
            let name = cap[1].to_string();
            if !vars.contains(&name) {
                vars.push(name);
            }
        }
        vars
    }

    pub fn render(&self, vars: &[(&str, &str)]) -> Result<String, PromptError> {
        let lookup: HashMap<&str, &str> = vars.iter().copied().collect();
        if let Some(missing) = self.variables().into_iter().find(|v| !lookup.contains_key(v.as_str())) {
            return Err(PromptError::MissingVariable {
                template: self.id.clone(),
                variable: missing,
            });
        }
        let rendered = placeholder_regex().replace_all(&self.template, |caps: &Captures| {
            lookup.get(&caps[1]).copied().unwrap_or_default().to_string()
        });
        Ok(rendered.into_owned())
    }
}

#[derive(Debug, Deserialize)]
struct OverrideFile {
    #[serde(default)]
    templates: HashMap<String, OverrideEntry>,
}

#[derive(Debug, Deserialize)]
struct OverrideEntry {
    template: String,
    #[serde(default)]
    description: Option<String>,
}

/// 模板注册表（显式构造并按引用传递，无全局状态）
#[derive(Debug, Clone)]
pub struct PromptEngine {
    templates: HashMap<String, PromptTemplate>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PromptEngine {
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut engine = Self::empty();
        for (id, description, template) in DEFAULT_TEMPLATES {
            engine.register(PromptTemplate::new(*id, *description, *template));
        }
        engine
    }

    /// 注册或替换模板
    pub fn register(&mut self, template: PromptTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<&PromptTemplate> {
        self.templates.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn render(&self, id: &str, vars: &[(&str, &str)]) -> Result<String, PromptError> {
        self.templates
            .get(id)
            .ok_or_else(|| PromptError::UnknownTemplate(id.to_string()))?
            .render(vars)
    }

    /// 渲染为带模板 id 标记的系统提示消息
    pub fn system_message(&self, id: &str, vars: &[(&str, &str)]) -> Result<Message, PromptError> {
        Ok(Message::system_prompt(id, self.render(id, vars)?))
    }

    /// 从 TOML 字符串覆盖模板，返回被覆盖 / 新增的数量
    pub fn apply_overrides_str(&mut self, toml_text: &str) -> Result<usize, PromptError> {
        let file: OverrideFile =
            toml::from_str(toml_text).map_err(|e| PromptError::Load(e.to_string()))?;
        let count = file.templates.len();
        for (id, entry) in file.templates {
            let description = entry
                .description
                .or_else(|| self.templates.get(&id).map(|t| t.description.clone()))
                .unwrap_or_default();
            tracing::debug!(template = %id, "prompt template overridden");
            self.register(PromptTemplate::new(id, description, entry.template));
        }
        Ok(count)
    }

    pub fn apply_overrides_file(&mut self, path: impl AsRef<Path>) -> Result<usize, PromptError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PromptError::Load(format!("{}: {}", path.display(), e)))?;
        let count = self.apply_overrides_str(&text)?;
        tracing::info!(path = %path.display(), count, "loaded prompt overrides");
        Ok(count)
    }
}
