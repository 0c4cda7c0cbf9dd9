//! 工具描述目录：(descriptions, compiled prompt) 不可变对
//!
//! 每次 with_constraint 都返回新目录并立即重编译提示词，下一次规划调用一定看到最新描述。

use std::collections::BTreeMap;
use std::sync::Arc;

/// 规划提示词里展示的工具描述，以及由它编译出的 system prompt
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    descriptions: Arc<BTreeMap<String, String>>,
    prompt: Arc<str>,
}

impl ToolCatalog {
    pub fn new<I, K, V>(tools: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let descriptions: BTreeMap<String, String> = tools
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_map(descriptions)
    }

    fn from_map(descriptions: BTreeMap<String, String>) -> Self {
        let prompt = compile_prompt(&descriptions);
        Self {
            descriptions: Arc::new(descriptions),
            prompt: prompt.into(),
        }
    }

    pub fn description(&self, tool: &str) -> Option<&str> {
        self.descriptions.get(tool).map(String::as_str)
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.descriptions.keys().map(String::as_str)
    }

    /// 编译好的 system prompt
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// 向某个工具的描述追加约束文本（如以往运行总结出的操作规则）。
    /// 每次调用都会追加，去重由调用方负责；未知工具记 warn 并原样返回。
    pub fn with_constraint(&self, tool: &str, constraint: &str) -> ToolCatalog {
        let Some(current) = self.descriptions.get(tool) else {
            tracing::warn!(tool = %tool, "Ignoring constraint for unknown tool");
            return self.clone();
        };
        let mut descriptions = (*self.descriptions).clone();
        let updated = if current.is_empty() {
            constraint.to_string()
        } else {
            format!("{}\n  Constraint: {}", current, constraint)
        };
        descriptions.insert(tool.to_string(), updated);
        Self::from_map(descriptions)
    }
}

fn compile_prompt(descriptions: &BTreeMap<String, String>) -> String {
    let listing = if descriptions.is_empty() {
        "(no tools available)".to_string()
    } else {
        descriptions
            .iter()
            .map(|(name, desc)| format!("- {}: {}", name, desc))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        r#"You are the planning module of an automated security assessment agent.
Break the requested action into a short, ordered list of concrete tool calls.

Available tools:
{listing}

Rules:
1. Only use tools from the list above. Never invent tool names.
2. Respond with exactly one JSON object and nothing else:
   {{"steps": [{{"tool": "<name>", "arguments": {{...}}, "description": "<why>"}}], "current_step": 0, "status": "pending"}}
3. Use an empty "steps" array when nothing needs to run."#
    )
}
