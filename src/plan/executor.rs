//! 计划执行器
//!
//! 组合 模型 + 校验 + 路由：
//! - build_plan：上游给了带优先级的动作就直接采纳（不再调用规划协作方），否则请求协作方拆解；
//!   两条路径都经过白名单过滤。
//! - run_step：一次只执行一个步骤，分发中的任何 panic 都折叠成失败结果，游标照常推进。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::backends::{ToolDispatcher, ToolResult};
use crate::llm::{LlmClient, Message};
use crate::plan::parse::parse_plan_response;
use crate::plan::validator::{filter, PlanOrigin, Rejection, Whitelist};
use crate::plan::{steps_from_actions, Plan, PrioritizedAction, Step, ToolCatalog};

/// 上游决策者的一次输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub rationale: String,
    /// 需要拆解的动作描述（无 actions 时交给规划协作方）
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub actions: Vec<PrioritizedAction>,
    /// 决策者认为任务已收敛
    #[serde(default)]
    pub done: bool,
}

/// 规划请求里附带的上下文提示
#[derive(Debug, Clone, Default)]
pub struct ContextHints {
    pub target: Option<String>,
    pub open_ports: Vec<u16>,
}

/// build_plan 的产物：计划本身 + 来源 + 拒绝事件
#[derive(Debug, Clone)]
pub struct BuiltPlan {
    pub plan: Plan,
    pub origin: PlanOrigin,
    pub rejections: Vec<Rejection>,
    /// 协作方回复无法解析（或调用失败）而得到的空计划；与"确实无事可做"的空计划区分开
    pub unparseable: bool,
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// 计划已无剩余步骤
    Finished,
    Executed { step: Step, result: ToolResult },
}

pub struct PlanExecutor {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<dyn ToolDispatcher>,
    whitelist: Whitelist,
    catalog: ToolCatalog,
}

impl PlanExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<dyn ToolDispatcher>,
        whitelist: Whitelist,
        catalog: ToolCatalog,
    ) -> Self {
        Self {
            llm,
            dispatcher,
            whitelist,
            catalog,
        }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// 追加某个工具的约束描述，替换为重新编译过提示词的新目录
    pub fn enrich_tool_description(&mut self, tool: &str, constraint: &str) {
        self.catalog = self.catalog.with_constraint(tool, constraint);
    }

    pub async fn build_plan(&self, decision: &Decision, hints: &ContextHints) -> BuiltPlan {
        if !decision.actions.is_empty() {
            return self.adopt(&decision.actions);
        }
        self.generate(decision, hints).await
    }

    /// 采纳上游动作：按 priority 稳定排序后过滤，不调用规划协作方
    pub fn adopt(&self, actions: &[PrioritizedAction]) -> BuiltPlan {
        let validated = filter(steps_from_actions(actions), &self.whitelist, PlanOrigin::Adopted);
        BuiltPlan {
            plan: Plan::new(validated.steps),
            origin: PlanOrigin::Adopted,
            rejections: validated.rejections,
            unparseable: false,
        }
    }

    async fn generate(&self, decision: &Decision, hints: &ContextHints) -> BuiltPlan {
        let messages = [
            Message::system(self.catalog.prompt()),
            Message::user(planning_request(decision, hints)),
        ];

        let candidates = match self.llm.complete(&messages).await {
            Ok(text) => match parse_plan_response(&text) {
                Ok(steps) => Some(steps),
                Err(e) => {
                    tracing::warn!(reason = %e, "Planning response unparseable, using empty plan");
                    None
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Planning call failed, using empty plan");
                None
            }
        };

        let unparseable = candidates.is_none();
        let validated = filter(
            candidates.unwrap_or_default(),
            &self.whitelist,
            PlanOrigin::Generated,
        );
        BuiltPlan {
            plan: Plan::new(validated.steps),
            origin: PlanOrigin::Generated,
            rejections: validated.rejections,
            unparseable,
        }
    }

    pub async fn run_step(&self, plan: Plan) -> (StepOutcome, Plan) {
        let Some(step) = plan.next_step().cloned() else {
            return (StepOutcome::Finished, plan);
        };

        let result = match AssertUnwindSafe(self.dispatcher.dispatch(&step.tool, &step.arguments))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = format!("dispatch panicked: {}", panic_message(panic.as_ref()));
                tracing::error!(tool = %step.tool, error = %message, "Dispatch panicked");
                ToolResult::failure(message)
            }
        };

        (StepOutcome::Executed { step, result }, plan.advance())
    }

    /// 顺序执行全部剩余步骤，返回 (步骤, 结果) 列表
    pub async fn run_to_completion(&self, mut plan: Plan) -> Vec<(Step, ToolResult)> {
        let mut executed = Vec::with_capacity(plan.len());
        loop {
            let (outcome, next) = self.run_step(plan).await;
            plan = next;
            match outcome {
                StepOutcome::Finished => break,
                StepOutcome::Executed { step, result } => executed.push((step, result)),
            }
        }
        executed
    }
}

fn planning_request(decision: &Decision, hints: &ContextHints) -> String {
    let mut request = format!(
        "Strategic context:\n{}\n\nAction to decompose:\n{}\n",
        if decision.rationale.is_empty() {
            "(none)"
        } else {
            &decision.rationale
        },
        decision.action
    );
    if let Some(target) = &hints.target {
        request.push_str(&format!("\nTarget: {}\n", target));
    }
    if !hints.open_ports.is_empty() {
        let ports: Vec<String> = hints.open_ports.iter().map(u16::to_string).collect();
        request.push_str(&format!("Known open ports: {}\n", ports.join(", ")));
    }
    request
}

/// panic 载荷转文本
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::plan::PlanStatus;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        calls: Mutex<Vec<String>>,
        panic_on: Option<&'static str>,
    }

    #[async_trait]
    impl ToolDispatcher for RecordingDispatcher {
        async fn dispatch(&self, tool: &str, _args: &Map<String, Value>) -> ToolResult {
            if self.panic_on == Some(tool) {
                panic!("backend exploded");
            }
            self.calls.lock().unwrap().push(tool.to_string());
            ToolResult::ok(format!("{} ok", tool))
        }
    }

    fn executor(llm: MockLlmClient, dispatcher: Arc<RecordingDispatcher>) -> PlanExecutor {
        let tools = [
            ("execute_shell_cmd", "Run a shell command"),
            ("rag_recall", "Recall findings"),
        ];
        PlanExecutor::new(
            Arc::new(llm),
            dispatcher,
            Whitelist::new(tools.iter().map(|(n, _)| *n)),
            ToolCatalog::new(tools),
        )
    }

    fn action(tool: &str, priority: i64) -> PrioritizedAction {
        PrioritizedAction {
            tool: tool.to_string(),
            arguments: Map::new(),
            description: String::new(),
            priority,
        }
    }

    #[tokio::test]
    async fn test_adoption_sorts_and_skips_planning_call() {
        let llm = MockLlmClient::new();
        let exec = executor(llm, Arc::new(RecordingDispatcher::default()));
        let decision = Decision {
            actions: vec![
                action("execute_shell_cmd", 2),
                action("invented_tool", 0),
                action("rag_recall", 1),
            ],
            ..Default::default()
        };
        let built = exec.build_plan(&decision, &ContextHints::default()).await;
        let tools: Vec<_> = built.plan.steps().iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools, vec!["rag_recall", "execute_shell_cmd"]);
        assert_eq!(built.origin, PlanOrigin::Adopted);
        assert_eq!(built.rejections.len(), 1);
        assert_eq!(built.rejections[0].tool, "invented_tool");
    }

    #[tokio::test]
    async fn test_adoption_never_consults_llm() {
        let llm = Arc::new(MockLlmClient::new());
        let exec = PlanExecutor::new(
            llm.clone(),
            Arc::new(RecordingDispatcher::default()),
            Whitelist::new(["rag_recall"]),
            ToolCatalog::new([("rag_recall", "")]),
        );
        let decision = Decision {
            actions: vec![action("rag_recall", 0)],
            ..Default::default()
        };
        exec.build_plan(&decision, &ContextHints::default()).await;
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_generated_plan_from_prose() {
        let llm = MockLlmClient::with_replies([
            r#"Sure! {"steps":[{"tool":"execute_shell_cmd","arguments":{"command":"id"},"description":"x"}],"current_step":0,"status":"pending"} Let me know."#,
        ]);
        let exec = executor(llm, Arc::new(RecordingDispatcher::default()));
        let decision = Decision {
            action: "check user".to_string(),
            ..Default::default()
        };
        let built = exec.build_plan(&decision, &ContextHints::default()).await;
        assert_eq!(built.plan.len(), 1);
        assert_eq!(built.plan.steps()[0].tool, "execute_shell_cmd");
        assert_eq!(built.origin, PlanOrigin::Generated);
        assert!(!built.unparseable);
    }

    #[tokio::test]
    async fn test_unparseable_response_yields_empty_pending_plan() {
        let llm = MockLlmClient::with_replies(["no json here"]);
        let exec = executor(llm, Arc::new(RecordingDispatcher::default()));
        let built = exec
            .build_plan(&Decision::default(), &ContextHints::default())
            .await;
        assert!(built.plan.is_empty());
        assert_eq!(built.plan.cursor(), 0);
        assert_eq!(built.plan.status(), PlanStatus::Pending);
        assert!(built.unparseable);
    }

    #[tokio::test]
    async fn test_generated_plan_is_filtered() {
        let llm = MockLlmClient::with_replies([
            r#"{"steps":[{"tool":"nmap_magic"},{"tool":"rag_recall","arguments":{"observation":"x"}}]}"#,
        ]);
        let exec = executor(llm, Arc::new(RecordingDispatcher::default()));
        let built = exec
            .build_plan(&Decision::default(), &ContextHints::default())
            .await;
        assert_eq!(built.plan.len(), 1);
        assert_eq!(built.rejections[0].tool, "nmap_magic");
        assert_eq!(built.rejections[0].origin, PlanOrigin::Generated);
    }

    #[tokio::test]
    async fn test_hints_and_enrichment_reach_prompt() {
        let llm = Arc::new(MockLlmClient::new());
        let mut exec = PlanExecutor::new(
            llm.clone(),
            Arc::new(RecordingDispatcher::default()),
            Whitelist::new(["execute_shell_cmd"]),
            ToolCatalog::new([("execute_shell_cmd", "Run a shell command")]),
        );
        exec.enrich_tool_description("execute_shell_cmd", "always add -T4 to nmap");
        let hints = ContextHints {
            target: Some("10.0.0.5".to_string()),
            open_ports: vec![22, 80],
        };
        exec.build_plan(&Decision::default(), &hints).await;

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0][0].content.contains("always add -T4 to nmap"));
        assert!(requests[0][1].content.contains("Target: 10.0.0.5"));
        assert!(requests[0][1].content.contains("22, 80"));
    }

    #[tokio::test]
    async fn test_run_step_advances_until_finished() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let exec = executor(MockLlmClient::new(), dispatcher.clone());
        let plan = Plan::new(vec![
            Step::new("rag_recall", Map::new(), ""),
            Step::new("execute_shell_cmd", json!({"command": "id"}).as_object().cloned().unwrap(), ""),
        ]);

        let (outcome, plan) = exec.run_step(plan).await;
        assert!(matches!(outcome, StepOutcome::Executed { ref result, .. } if result.success));
        assert_eq!(plan.cursor(), 1);
        assert_eq!(plan.status(), PlanStatus::InProgress);

        let (_, plan) = exec.run_step(plan).await;
        assert_eq!(plan.status(), PlanStatus::Completed);

        let (outcome, plan) = exec.run_step(plan).await;
        assert!(matches!(outcome, StepOutcome::Finished));
        assert_eq!(plan.cursor(), 2);
        assert_eq!(
            *dispatcher.calls.lock().unwrap(),
            vec!["rag_recall".to_string(), "execute_shell_cmd".to_string()]
        );
    }

    #[tokio::test]
    async fn test_panicking_dispatch_becomes_failed_step() {
        let dispatcher = Arc::new(RecordingDispatcher {
            panic_on: Some("execute_shell_cmd"),
            ..Default::default()
        });
        let exec = executor(MockLlmClient::new(), dispatcher);
        let plan = Plan::new(vec![
            Step::new("execute_shell_cmd", Map::new(), ""),
            Step::new("rag_recall", Map::new(), ""),
        ]);
        let executed = exec.run_to_completion(plan).await;
        assert_eq!(executed.len(), 2);
        assert!(!executed[0].1.success);
        assert!(executed[0]
            .1
            .error
            .as_deref()
            .unwrap()
            .contains("backend exploded"));
        assert!(executed[1].1.success);
    }
}
