//! 决策者：每轮给出下一步要做什么
//!
//! LlmDecisionMaker 要求协作方返回 `{rationale, action, actions, done}`；
//! 回复无法解析时退化为"把原文当作待拆解动作"，交给规划路径处理，不让整个任务失败。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::EngineError;
use crate::llm::{LlmClient, Message};
use crate::plan::{extract_json_object, Decision};
use crate::recon::StepRecord;

/// 历史里每条输出在提示词中保留的最大字符数
const HISTORY_OUTPUT_CHARS: usize = 500;
/// 提示词里最多带最近多少条步骤记录
const HISTORY_WINDOW: usize = 12;

/// 决策上下文
pub struct DecisionContext<'a> {
    pub target: &'a str,
    pub iteration: usize,
    pub max_iterations: usize,
    pub history: &'a [StepRecord],
    pub tools: Vec<&'a str>,
}

#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Decision, EngineError>;
}

pub struct LlmDecisionMaker {
    llm: Arc<dyn LlmClient>,
}

impl LlmDecisionMaker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl DecisionMaker for LlmDecisionMaker {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Decision, EngineError> {
        let messages = [
            Message::system(system_prompt(&ctx.tools)),
            Message::user(user_prompt(ctx)),
        ];
        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(EngineError::Llm)?;
        Ok(parse_decision(&reply))
    }
}

/// 解析决策回复；没有可用 JSON 时把原文作为 action
pub fn parse_decision(reply: &str) -> Decision {
    if let Some(value) = extract_json_object(reply) {
        match serde_json::from_value::<Decision>(value) {
            Ok(decision) => return decision,
            Err(e) => tracing::warn!(error = %e, "Decision JSON has unexpected shape"),
        }
    }
    Decision {
        action: reply.trim().to_string(),
        ..Default::default()
    }
}

fn system_prompt(tools: &[&str]) -> String {
    format!(
        r#"You are the decision module of an automated reconnaissance agent working on an authorized target.
Each turn, review what has been done so far and decide the next action.

Available tools: {}

Respond with one JSON object:
{{"rationale": "<why>", "action": "<next action in plain words>", "actions": [{{"tool": "<name>", "arguments": {{...}}, "description": "<what>", "priority": 1}}], "done": false}}
- Fill "actions" only when you already know the exact tool calls; otherwise leave it empty and describe the action.
- Set "done": true when reconnaissance is complete; put the summary of findings in "rationale"."#,
        if tools.is_empty() {
            "(none)".to_string()
        } else {
            tools.join(", ")
        }
    )
}

fn user_prompt(ctx: &DecisionContext<'_>) -> String {
    let mut prompt = format!(
        "Target: {}\nIteration: {} of {}\n",
        ctx.target, ctx.iteration, ctx.max_iterations
    );
    if ctx.history.is_empty() {
        prompt.push_str("\nNo steps executed yet.\n");
        return prompt;
    }
    prompt.push_str("\nRecent steps:\n");
    let skip = ctx.history.len().saturating_sub(HISTORY_WINDOW);
    for record in ctx.history.iter().skip(skip) {
        let status = if record.success { "ok" } else { "failed" };
        let body = if record.success {
            record.output.as_str()
        } else {
            record.error.as_deref().unwrap_or("")
        };
        let body: String = body.chars().take(HISTORY_OUTPUT_CHARS).collect();
        prompt.push_str(&format!("- {} [{}]: {}\n", record.tool, status, body));
    }
    prompt
}
