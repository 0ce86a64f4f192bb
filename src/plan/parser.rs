//! LLM 输出中的 JSON 提取与宽松反序列化
//!
//! 优先取 ```json 围栏块；没有时扫描第一个括号平衡的 `{...}`（跳过字符串内的括号）。

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// 提取 JSON 文本片段；找不到时返回 None
pub fn extract_json_block(output: &str) -> Option<&str> {
    if let Some(block) = fenced_block(output) {
        return Some(block);
    }
    first_balanced_object(output)
}

fn fenced_block(output: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(rel) = output[search_from..].find("```") {
        let open = search_from + rel + 3;
        let rest = &output[open..];
        // 跳过语言标记（json / JSON / 空）
        let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
        let lang = rest[..body_start].trim();
        let body = &rest[body_start..];
        let close = body.find("```")?;
        let candidate = body[..close].trim();
        if (lang.is_empty() || lang.eq_ignore_ascii_case("json")) && candidate.starts_with('{') {
            return Some(candidate);
        }
        search_from = open + body_start + close + 3;
        if search_from >= output.len() {
            break;
        }
    }
    None
}

/// 第一个括号平衡的对象，字符串与转义内的括号不计数
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 提取并反序列化；错误信息可直接作为纠正提示的一部分
pub fn parse_json<T: DeserializeOwned>(output: &str) -> Result<T, String> {
    let block = extract_json_block(output).ok_or_else(|| "no JSON object found in response".to_string())?;
    serde_json::from_str(block).map_err(|e| format!("invalid JSON: {}", e))
}

/// LLM 返回的原始计划（字段都可缺省，由校验器补全与拒绝）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawPlan {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phases: Vec<RawPhase>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawPhase {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub complexity: Option<String>,
    /// 依赖可能是 id 字符串，也可能是阶段序号
    #[serde(default, alias = "dependsOn")]
    pub dependencies: Vec<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, alias = "fileHints")]
    pub files: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<RawTask>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "description")]
    pub goal: Option<String>,
    #[serde(default, alias = "fileHints")]
    pub files: Vec<String>,
    #[serde(default, alias = "steps")]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block_preferred() {
        let out = "Here you go:\n```json\n{\"title\": \"A\"}\n```\nand {\"other\": 1}";
        assert_eq!(extract_json_block(out), Some("{\"title\": \"A\"}"));
    }

    #[test]
    fn test_unlabelled_fence() {
        let out = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_block(out), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_skips_non_json_fence() {
        let out = "```rust\nfn main() {}\n```\n```json\n{\"a\": 2}\n```";
        assert_eq!(extract_json_block(out), Some("{\"a\": 2}"));
    }

    #[test]
    fn test_balanced_span_ignores_braces_in_strings() {
        let out = r#"Sure! {"title": "use {braces} and \"quotes\"", "n": {"x": 1}} trailing }"#;
        assert_eq!(
            extract_json_block(out),
            Some(r#"{"title": "use {braces} and \"quotes\"", "n": {"x": 1}}"#)
        );
    }

    #[test]
    fn test_unbalanced_returns_none() {
        assert_eq!(extract_json_block("{\"a\": 1"), None);
        assert_eq!(extract_json_block("no json here"), None);
    }

    #[test]
    fn test_parse_raw_plan_lenient() {
        let out = r#"{"title":"T","phases":[{"title":"P1","dependsOn":[1],"tasks":[{"title":"x","steps":["a"]}]}]}"#;
        let raw: RawPlan = parse_json(out).unwrap();
        assert_eq!(raw.phases.len(), 1);
        assert_eq!(raw.phases[0].dependencies.len(), 1);
        assert_eq!(raw.phases[0].tasks[0].instructions, vec!["a"]);
        assert!(raw.description.is_none());
    }

    #[test]
    fn test_parse_error_message() {
        let err = parse_json::<RawPlan>("nothing").unwrap_err();
        assert!(err.contains("no JSON object"));
    }
}
