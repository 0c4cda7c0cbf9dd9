//! 计划层：数据模型、白名单校验、工具描述目录、回复解析与执行器

pub mod catalog;
pub mod executor;
pub mod model;
pub mod parse;
pub mod validator;

pub use catalog::ToolCatalog;
pub use executor::{BuiltPlan, ContextHints, Decision, PlanExecutor, StepOutcome};
pub use model::{steps_from_actions, Plan, PlanStatus, PrioritizedAction, Step};
pub use parse::{extract_json_object, extract_json_span, parse_plan_response, Unparseable};
pub use validator::{filter, PlanOrigin, Rejection, Validated, Whitelist};
