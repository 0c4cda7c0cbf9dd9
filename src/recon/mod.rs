//! 侦察阶段：决策者 + 迭代循环

pub mod cycle;
pub mod decision;

pub use cycle::{execute_plan, truncate_output, ReconCycle, ReconReport, StepRecord};
pub use decision::{parse_decision, DecisionContext, DecisionMaker, LlmDecisionMaker};
