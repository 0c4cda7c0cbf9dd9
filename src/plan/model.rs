//! 计划数据模型与游标推进
//!
//! Plan 是值对象：advance 消耗旧计划并返回新计划，cursor 每次严格 +1。
//! 非空计划满足 `status == Completed` 当且仅当 `cursor == steps.len()`；
//! 空计划停留在 Pending，表示"无事可做"的合法终态。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 单个工具调用步骤（创建后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub description: String,
}

impl Step {
    pub fn new(tool: impl Into<String>, arguments: Map<String, Value>, description: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
}

/// 步骤序列 + 游标 + 状态；序列化字段与规划协作方约定一致（cursor 对应 current_step）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<Step>,
    #[serde(rename = "current_step")]
    cursor: usize,
    status: PlanStatus,
}

impl Plan {
    /// 新计划：游标在 0，状态 Pending
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            cursor: 0,
            status: PlanStatus::Pending,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 还有未执行的步骤
    pub fn has_remaining(&self) -> bool {
        self.cursor < self.steps.len()
    }

    /// 当前步骤；游标到尾时返回 None。无副作用
    pub fn next_step(&self) -> Option<&Step> {
        self.steps.get(self.cursor)
    }

    /// 推进游标，返回新计划。
    ///
    /// # Panics
    ///
    /// 游标已到尾时调用属于编程错误，直接 panic 而不是静默夹紧；调用方应先检查 `next_step`。
    pub fn advance(self) -> Plan {
        assert!(
            self.cursor < self.steps.len(),
            "Plan::advance called past the end (cursor={}, len={})",
            self.cursor,
            self.steps.len()
        );
        let cursor = self.cursor + 1;
        let status = if cursor == self.steps.len() {
            PlanStatus::Completed
        } else {
            PlanStatus::InProgress
        };
        Plan {
            steps: self.steps,
            cursor,
            status,
        }
    }
}

impl Default for Plan {
    fn default() -> Self {
        Self::empty()
    }
}

/// 上游决策给出的带优先级候选动作（数值越小越先执行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrioritizedAction {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i64,
}

/// 按 priority 升序排序（稳定排序，同优先级保持原顺序）并转为步骤
pub fn steps_from_actions(actions: &[PrioritizedAction]) -> Vec<Step> {
    let mut sorted: Vec<&PrioritizedAction> = actions.iter().collect();
    sorted.sort_by_key(|a| a.priority);
    sorted
        .into_iter()
        .map(|a| Step::new(a.tool.clone(), a.arguments.clone(), a.description.clone()))
        .collect()
}
