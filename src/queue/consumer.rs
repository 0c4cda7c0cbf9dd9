//! 任务消费循环
//!
//! 一次只处理一个任务：阻塞弹出 → 解析信封 → 读取参数 → running → 按阶段执行 → 原子提交终态并发布完成通知。
//! 信封/参数错误直接丢弃（不写终态）；进入 running 之后的任何失败都会落成 failed 并发布恰好一条通知。
//! 关闭信号只在两个任务之间生效。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::backends::{BackendKind, BackendRouter};
use crate::config::AppSection;
use crate::core::{Disposition, EngineError};
use crate::llm::LlmClient;
use crate::plan::executor::panic_message;
use crate::plan::{ContextHints, PlanExecutor, PrioritizedAction};
use crate::queue::{Envelope, Phase, TaskBroker, TaskDescriptor, TaskLog, TaskOutcome, TaskState};
use crate::recon::{execute_plan, DecisionMaker, LlmDecisionMaker, ReconCycle};

/// 存储出错后再次弹出前的等待时间
const POP_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// exec 阶段 options.command 对应的工具
const SHELL_TOOL: &str = "execute_shell_cmd";

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct TaskConsumer {
    broker: Arc<dyn TaskBroker>,
    router: Arc<BackendRouter>,
    llm: Arc<dyn LlmClient>,
    decider: Arc<dyn DecisionMaker>,
    settings: AppSection,
}

impl TaskConsumer {
    pub fn new(
        broker: Arc<dyn TaskBroker>,
        router: Arc<BackendRouter>,
        llm: Arc<dyn LlmClient>,
        settings: AppSection,
    ) -> Self {
        Self {
            broker,
            router,
            decider: Arc::new(LlmDecisionMaker::new(llm.clone())),
            llm,
            settings,
        }
    }

    /// 替换默认的 LLM 决策者
    pub fn with_decision_maker(mut self, decider: Arc<dyn DecisionMaker>) -> Self {
        self.decider = decider;
        self
    }

    /// 主循环：直到 token 被取消
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!("Task consumer started");
        loop {
            let popped = tokio::select! {
                _ = token.cancelled() => break,
                popped = self.broker.pop() => popped,
            };

            let raw = match popped {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pop from task queue");
                    let cancelled = tokio::select! {
                        _ = token.cancelled() => true,
                        _ = tokio::time::sleep(POP_ERROR_BACKOFF) => false,
                    };
                    if cancelled {
                        break;
                    }
                    continue;
                }
            };

            match self.process_envelope(&raw).await {
                Ok(state) => tracing::info!(state = %state, "Task finished"),
                Err(e) => match e.disposition() {
                    Disposition::Drop => tracing::warn!(error = %e, "Dropping task"),
                    Disposition::Fail => tracing::error!(error = %e, "Task handling failed"),
                },
            }
        }
        tracing::info!("Task consumer stopped");
    }

    /// 处理一条信封，返回写入的终态。
    /// Err 表示任务被丢弃（信封/参数问题）或存储写入失败。
    pub async fn process_envelope(&self, raw: &str) -> Result<TaskState, EngineError> {
        let envelope = Envelope::parse(raw)?;
        let fields = self.broker.load_task(&envelope.key).await?;
        if fields.is_empty() {
            return Err(EngineError::MissingParameters(format!(
                "no task stored at '{}'",
                envelope.key
            )));
        }
        let task = TaskDescriptor::from_fields(&fields)?;
        if task.state.is_terminal() {
            return Err(EngineError::MissingParameters(format!(
                "task '{}' is already {}",
                task.task_id, task.state
            )));
        }
        if task.task_id != envelope.task_id || task.tenant_id != envelope.tenant_id {
            tracing::warn!(
                key = %envelope.key,
                envelope_task = %envelope.task_id,
                stored_task = %task.task_id,
                "Envelope and stored task disagree, using stored values"
            );
        }

        self.broker.mark_running(&envelope.key, &timestamp()).await?;

        let log = TaskLog::attach(
            self.broker.clone(),
            task.log_channel(),
            task.task_id.clone(),
            task.phase.clone(),
        );
        log.info(format!("Task started (target: {})", task.target));

        let outcome = match AssertUnwindSafe(self.execute(&task, &log))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => {
                log.info("Task completed");
                TaskOutcome::Completed(result)
            }
            Ok(Err(e)) => {
                log.error(format!("Task failed: {}", e));
                TaskOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = format!("phase panicked: {}", panic_message(panic.as_ref()));
                log.error(format!("Task failed: {}", message));
                TaskOutcome::Failed(message)
            }
        };
        log.finish().await;

        let (prompt_tokens, completion_tokens, total_tokens) = self.llm.token_usage();
        tracing::debug!(
            task_id = %task.task_id,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            "Cumulative LLM token usage"
        );

        let completed_at = timestamp();
        let outcome = match outcome {
            TaskOutcome::Completed(Value::Object(mut result)) => {
                result.insert("completed_at".to_string(), json!(completed_at));
                TaskOutcome::Completed(Value::Object(result))
            }
            other => other,
        };
        self.broker
            .commit(
                &envelope.key,
                &task.completion_channel(),
                &outcome,
                &completed_at,
            )
            .await?;
        Ok(outcome.state())
    }

    async fn execute(&self, task: &TaskDescriptor, log: &TaskLog) -> Result<Value, EngineError> {
        let phase = Phase::parse(&task.phase)?;

        let capabilities = self.router.capabilities();
        let mut executor = PlanExecutor::new(
            self.llm.clone(),
            self.router.clone(),
            capabilities.whitelist.clone(),
            capabilities.catalog(),
        );
        if let Some(constraints) = task.options.get("tool_constraints").and_then(Value::as_object) {
            for (tool, text) in constraints {
                if let Some(text) = text.as_str() {
                    executor.enrich_tool_description(tool, text);
                }
            }
        }
        let hints = ContextHints {
            target: Some(task.target.clone()),
            open_ports: open_ports(&task.options),
        };

        match phase {
            Phase::Recon => self.run_recon(task, &executor, &hints, log).await,
            Phase::Exec => self.run_exec(task, &executor, log).await,
        }
    }

    async fn run_recon(
        &self,
        task: &TaskDescriptor,
        executor: &PlanExecutor,
        hints: &ContextHints,
        log: &TaskLog,
    ) -> Result<Value, EngineError> {
        let max_iterations = task
            .options
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.settings.max_iterations);

        let report = ReconCycle::new(
            executor,
            self.decider.as_ref(),
            max_iterations,
            self.settings.max_output_chars,
        )
        .run(hints, log)
        .await?;

        Ok(json!({
            "task_id": task.task_id,
            "target": task.target,
            "phase": Phase::Recon.as_str(),
            "iterations": report.iterations,
            "converged": report.converged,
            "summary": report.summary,
            "steps": report.steps,
            "rejected_tools": report.rejected_tools,
        }))
    }

    async fn run_exec(
        &self,
        task: &TaskDescriptor,
        executor: &PlanExecutor,
        log: &TaskLog,
    ) -> Result<Value, EngineError> {
        if !self.router.is_connected(BackendKind::Execution) {
            return Err(EngineError::BackendUnavailable(
                BackendKind::Execution.to_string(),
            ));
        }

        let actions = exec_actions(&task.options)?;
        let built = executor.adopt(&actions);
        let rejected_tools: Vec<String> = built.rejections.iter().map(|r| r.tool.clone()).collect();
        for tool in &rejected_tools {
            log.warn(format!("Rejected tool '{}' from {}", tool, built.origin));
        }
        log.info(format!("Executing {} step(s)", built.plan.len()));

        let steps = execute_plan(executor, built.plan, log, self.settings.max_output_chars).await;

        Ok(json!({
            "task_id": task.task_id,
            "target": task.target,
            "phase": Phase::Exec.as_str(),
            "steps": steps,
            "rejected_tools": rejected_tools,
        }))
    }
}

fn open_ports(options: &Map<String, Value>) -> Vec<u16> {
    options
        .get("ports")
        .and_then(Value::as_array)
        .map(|ports| {
            ports
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|p| u16::try_from(p).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// exec 阶段的动作：options.steps（带优先级的动作列表）或单条 options.command
fn exec_actions(options: &Map<String, Value>) -> Result<Vec<PrioritizedAction>, EngineError> {
    if let Some(steps) = options.get("steps") {
        return Ok(serde_json::from_value(steps.clone())?);
    }
    if let Some(command) = options.get("command").and_then(Value::as_str) {
        let mut arguments = Map::new();
        arguments.insert("command".to_string(), json!(command));
        return Ok(vec![PrioritizedAction {
            tool: SHELL_TOOL.to_string(),
            arguments,
            description: "Run operator-supplied command".to_string(),
            priority: 0,
        }]);
    }
    Err(EngineError::MissingParameters(
        "exec phase needs options.steps or options.command".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_open_ports_ignores_junk() {
        assert_eq!(
            open_ports(&options(json!({"ports": [22, "80", 443, 70000]}))),
            vec![22, 443]
        );
        assert!(open_ports(&Map::new()).is_empty());
    }

    #[test]
    fn test_exec_actions_from_command() {
        let actions = exec_actions(&options(json!({"command": "id"}))).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].tool, "execute_shell_cmd");
        assert_eq!(actions[0].arguments["command"], "id");
    }

    #[test]
    fn test_exec_actions_from_steps() {
        let actions = exec_actions(&options(json!({
            "steps": [
                {"tool": "write_file", "arguments": {"path": "/tmp/a"}, "priority": 2},
                {"tool": "execute_shell_cmd", "priority": 1}
            ]
        })))
        .unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1].priority, 1);
    }

    #[test]
    fn test_exec_actions_missing() {
        assert!(exec_actions(&Map::new()).is_err());
    }

    #[test]
    fn test_timestamp_is_rfc3339_utc() {
        let ts = timestamp();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
