//! 需求复杂度启发式：字数分档决定阶段数范围，特定关键词或技术栈数量会放宽上限

use crate::plan::types::PhaseRange;

/// 阶段数硬上限
pub const MAX_PHASES: usize = 1000;

/// 出现即视为大型系统的关键词
const SCALE_KEYWORDS: &[&str] = &[
    "microservice",
    "microservices",
    "enterprise",
    "distributed",
    "multi-tenant",
    "multitenant",
];

/// (规范名, 别名)：按词匹配，大小写不敏感
const TECHNOLOGIES: &[(&str, &[&str])] = &[
    ("react", &["react", "reactjs", "react.js"]),
    ("vue", &["vue", "vuejs", "vue.js"]),
    ("angular", &["angular"]),
    ("svelte", &["svelte", "sveltekit"]),
    ("next.js", &["next.js", "nextjs"]),
    ("node.js", &["node", "nodejs", "node.js"]),
    ("express", &["express", "expressjs"]),
    ("django", &["django"]),
    ("flask", &["flask"]),
    ("fastapi", &["fastapi"]),
    ("rails", &["rails"]),
    ("spring", &["spring", "springboot"]),
    ("rust", &["rust"]),
    ("go", &["golang"]),
    ("python", &["python"]),
    ("java", &["java"]),
    ("typescript", &["typescript", "ts"]),
    ("kotlin", &["kotlin"]),
    ("swift", &["swift", "swiftui"]),
    ("flutter", &["flutter"]),
    ("postgresql", &["postgres", "postgresql"]),
    ("mysql", &["mysql"]),
    ("mongodb", &["mongodb", "mongo"]),
    ("redis", &["redis"]),
    ("sqlite", &["sqlite"]),
    ("graphql", &["graphql"]),
    ("grpc", &["grpc"]),
    ("docker", &["docker"]),
    ("kubernetes", &["kubernetes", "k8s"]),
    ("aws", &["aws"]),
    ("gcp", &["gcp"]),
    ("azure", &["azure"]),
    ("kafka", &["kafka"]),
    ("rabbitmq", &["rabbitmq"]),
    ("elasticsearch", &["elasticsearch"]),
    ("terraform", &["terraform"]),
    ("tailwind", &["tailwind", "tailwindcss"]),
    ("stripe", &["stripe"]),
    ("websocket", &["websocket", "websockets"]),
];

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '.' || c == '-' || c == '+' || c == '#'))
        .map(|w| w.trim_matches('.').to_lowercase())
        .filter(|w| !w.is_empty())
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// 检测到的技术关键词（规范名，按首次出现排序，去重）
pub fn detect_technologies(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for word in tokens(text) {
        if let Some((canonical, _)) = TECHNOLOGIES
            .iter()
            .find(|(_, aliases)| aliases.contains(&word.as_str()))
        {
            if !found.iter().any(|f| f == canonical) {
                found.push(canonical.to_string());
            }
        }
    }
    found
}

fn has_scale_keyword(text: &str) -> bool {
    tokens(text).any(|w| SCALE_KEYWORDS.contains(&w.as_str()))
}

/// 仅按字数分档的范围
pub fn base_range(words: usize) -> PhaseRange {
    let (min, max) = match words {
        0..=99 => (3, 10),
        100..=499 => (10, 50),
        500..=999 => (50, 200),
        _ => (100, MAX_PHASES),
    };
    PhaseRange { min, max }
}

/// 需求文本对应的阶段数范围
pub fn phase_range(requirements: &str) -> PhaseRange {
    let mut range = base_range(word_count(requirements));
    if has_scale_keyword(requirements) || detect_technologies(requirements).len() >= 4 {
        range.max = (range.max * 3 / 2).min(MAX_PHASES);
    }
    range
}
