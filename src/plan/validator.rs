//! 工具校验：用白名单过滤候选步骤
//!
//! 所有产出 Plan 的路径（采纳上游动作 / 规划协作方生成）都必须经过 filter，
//! 不在白名单里的工具一律丢弃并记录拒绝事件，永远不会被执行。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::plan::Step;

/// 可调用工具名的不可变快照（连接后端时生成一次，按值传入校验与提示词构建）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    names: Arc<BTreeSet<String>>,
}

impl Whitelist {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: Arc::new(names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.names.contains(tool)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// 步骤来源，用于拒绝事件审计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    Adopted,
    Generated,
}

impl fmt::Display for PlanOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanOrigin::Adopted => write!(f, "adopted plan"),
            PlanOrigin::Generated => write!(f, "generated plan"),
        }
    }
}

/// 被丢弃的步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub tool: String,
    pub origin: PlanOrigin,
}

/// 过滤结果：保留的步骤（保持原相对顺序）与拒绝事件
#[derive(Debug, Clone, Default)]
pub struct Validated {
    pub steps: Vec<Step>,
    pub rejections: Vec<Rejection>,
}

/// 保留 tool 在白名单中的步骤；其余丢弃并以 warn 级别记录
pub fn filter(candidates: Vec<Step>, whitelist: &Whitelist, origin: PlanOrigin) -> Validated {
    let mut out = Validated::default();
    for step in candidates {
        if whitelist.contains(&step.tool) {
            out.steps.push(step);
        } else {
            tracing::warn!(tool = %step.tool, origin = %origin, "Rejected hallucinated tool");
            out.rejections.push(Rejection {
                tool: step.tool,
                origin,
            });
        }
    }
    out
}
