//! 侦察循环：决策 → 建计划 → 逐步执行，直到决策者宣布完成或达到迭代上限

use serde::Serialize;

use crate::backends::ToolResult;
use crate::core::EngineError;
use crate::plan::{ContextHints, Plan, PlanExecutor, Step, StepOutcome};
use crate::queue::TaskLog;
use crate::recon::{DecisionContext, DecisionMaker};

const TRUNCATION_SUFFIX: &str = "\n...(truncated)";

/// 单步执行记录（进入结果载荷）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub tool: String,
    pub description: String,
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    pub fn new(step: &Step, result: ToolResult, max_output_chars: usize) -> Self {
        Self {
            tool: step.tool.clone(),
            description: step.description.clone(),
            success: result.success,
            output: truncate_output(result.output, max_output_chars),
            error: result.error,
        }
    }
}

/// 超过 max_chars 个字符时截断并追加标记
pub fn truncate_output(output: String, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &output[..cut], TRUNCATION_SUFFIX),
        None => output,
    }
}

/// 按游标顺序执行计划的全部步骤，逐步写任务日志
pub async fn execute_plan(
    executor: &PlanExecutor,
    mut plan: Plan,
    log: &TaskLog,
    max_output_chars: usize,
) -> Vec<StepRecord> {
    let mut records = Vec::with_capacity(plan.len());
    loop {
        let (outcome, next) = executor.run_step(plan).await;
        plan = next;
        let StepOutcome::Executed { step, result } = outcome else {
            break;
        };
        if result.success {
            log.info(format!("{} succeeded", step.tool));
        } else {
            log.warn(format!(
                "{} failed: {}",
                step.tool,
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
        records.push(StepRecord::new(&step, result, max_output_chars));
    }
    records
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconReport {
    pub iterations: usize,
    pub converged: bool,
    pub summary: String,
    pub steps: Vec<StepRecord>,
    pub rejected_tools: Vec<String>,
}

pub struct ReconCycle<'a> {
    executor: &'a PlanExecutor,
    decider: &'a dyn DecisionMaker,
    max_iterations: usize,
    max_output_chars: usize,
}

impl<'a> ReconCycle<'a> {
    pub fn new(
        executor: &'a PlanExecutor,
        decider: &'a dyn DecisionMaker,
        max_iterations: usize,
        max_output_chars: usize,
    ) -> Self {
        Self {
            executor,
            decider,
            max_iterations: max_iterations.max(1),
            max_output_chars,
        }
    }

    pub async fn run(&self, hints: &ContextHints, log: &TaskLog) -> Result<ReconReport, EngineError> {
        let target = hints.target.as_deref().unwrap_or("");
        let tools: Vec<String> = self.executor.whitelist().iter().map(String::from).collect();
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut rejected_tools: Vec<String> = Vec::new();
        let mut converged = false;
        let mut summary = String::new();
        let mut iterations = 0;

        while iterations < self.max_iterations {
            iterations += 1;
            let ctx = DecisionContext {
                target,
                iteration: iterations,
                max_iterations: self.max_iterations,
                history: &steps,
                tools: tools.iter().map(String::as_str).collect(),
            };
            let decision = self.decider.decide(&ctx).await?;

            if decision.done {
                converged = true;
                summary = decision.rationale.clone();
                log.info(format!("Iteration {}: reconnaissance complete", iterations));
                break;
            }
            log.info(format!(
                "Iteration {}: {}",
                iterations,
                if decision.action.is_empty() {
                    &decision.rationale
                } else {
                    &decision.action
                }
            ));

            let built = self.executor.build_plan(&decision, hints).await;
            for rejection in &built.rejections {
                log.warn(format!(
                    "Rejected tool '{}' from {}",
                    rejection.tool, rejection.origin
                ));
                rejected_tools.push(rejection.tool.clone());
            }
            if built.unparseable {
                log.warn("Planning response was unparseable; nothing to run this iteration");
            }
            if built.plan.is_empty() {
                continue;
            }

            steps.extend(execute_plan(self.executor, built.plan, log, self.max_output_chars).await);
        }

        if summary.is_empty() {
            let succeeded = steps.iter().filter(|s| s.success).count();
            summary = format!(
                "{} of {} steps succeeded over {} iterations{}",
                succeeded,
                steps.len(),
                iterations,
                if converged { "" } else { " (iteration cap reached)" }
            );
        }

        Ok(ReconReport {
            iterations,
            converged,
            summary,
            steps,
            rejected_tools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ToolDispatcher;
    use crate::llm::MockLlmClient;
    use crate::plan::{Decision, PrioritizedAction, ToolCatalog, Whitelist};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::{Arc, Mutex};

    struct EchoDispatcher;

    #[async_trait]
    impl ToolDispatcher for EchoDispatcher {
        async fn dispatch(&self, tool: &str, _args: &Map<String, Value>) -> ToolResult {
            if tool == "execute_shell_cmd" {
                ToolResult::failure("Kali MCP server not connected")
            } else {
                ToolResult::ok("x".repeat(50))
            }
        }
    }

    struct Scripted(Mutex<Vec<Decision>>);

    #[async_trait]
    impl DecisionMaker for Scripted {
        async fn decide(&self, _ctx: &DecisionContext<'_>) -> Result<Decision, EngineError> {
            let mut q = self.0.lock().unwrap();
            Ok(if q.is_empty() {
                Decision {
                    done: true,
                    ..Default::default()
                }
            } else {
                q.remove(0)
            })
        }
    }

    fn executor() -> PlanExecutor {
        let tools = [("execute_shell_cmd", ""), ("rag_recall", "")];
        PlanExecutor::new(
            Arc::new(MockLlmClient::new()),
            Arc::new(EchoDispatcher),
            Whitelist::new(tools.iter().map(|(n, _)| *n)),
            ToolCatalog::new(tools),
        )
    }

    fn act(tool: &str) -> PrioritizedAction {
        PrioritizedAction {
            tool: tool.to_string(),
            arguments: Map::new(),
            description: String::new(),
            priority: 0,
        }
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short".to_string(), 10), "short");
        assert_eq!(truncate_output("abcdef".to_string(), 3), "abc\n...(truncated)");
        assert_eq!(truncate_output("端口扫描".to_string(), 2), "端口\n...(truncated)");
    }

    #[tokio::test]
    async fn test_cycle_runs_until_done() {
        let exec = executor();
        let decider = Scripted(Mutex::new(vec![Decision {
            actions: vec![act("rag_recall"), act("execute_shell_cmd"), act("ghost")],
            ..Default::default()
        }]));
        let cycle = ReconCycle::new(&exec, &decider, 5, 10);
        let report = cycle
            .run(&ContextHints::default(), &TaskLog::detached("t1", "recon"))
            .await
            .unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps[0].output.ends_with("...(truncated)"));
        assert!(!report.steps[1].success);
        assert_eq!(report.rejected_tools, vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_cycle_stops_at_cap() {
        let exec = executor();
        let decisions = (0..10)
            .map(|_| Decision {
                actions: vec![act("rag_recall")],
                ..Default::default()
            })
            .collect();
        let decider = Scripted(Mutex::new(decisions));
        let cycle = ReconCycle::new(&exec, &decider, 3, 4000);
        let report = cycle
            .run(&ContextHints::default(), &TaskLog::detached("t1", "recon"))
            .await
            .unwrap();
        assert!(!report.converged);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.steps.len(), 3);
        assert!(report.summary.contains("iteration cap reached"));
    }
}
