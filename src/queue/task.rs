//! 队列信封、任务描述、状态与频道命名

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::EngineError;

/// 队列里弹出的信封：`{task_id, tenant_id, key}`，key 指向存储中的任务哈希
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub task_id: String,
    pub tenant_id: String,
    pub key: String,
}

impl Envelope {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| EngineError::MalformedEnvelope(format!("{}: {}", e, preview(raw))))?;
        for (field, value) in [
            ("task_id", &envelope.task_id),
            ("tenant_id", &envelope.tenant_id),
            ("key", &envelope.key),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::MalformedEnvelope(format!("empty '{}'", field)));
            }
        }
        Ok(envelope)
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(120).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            other => Err(EngineError::MissingParameters(format!(
                "unknown task state '{}'",
                other
            ))),
        }
    }
}

/// 支持的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 侦察/规划：决策 → 计划 → 执行的迭代循环
    Recon,
    /// 直接执行：必须已连接执行后端
    Exec,
}

impl Phase {
    pub fn parse(phase: &str) -> Result<Self, EngineError> {
        match phase.trim().to_ascii_lowercase().as_str() {
            "recon" | "reconnaissance" | "planning" => Ok(Phase::Recon),
            "exec" | "execute" | "execution" => Ok(Phase::Exec),
            _ => Err(EngineError::UnsupportedPhase(phase.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Recon => "recon",
            Phase::Exec => "exec",
        }
    }
}

/// 存储中的完整任务参数
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub tenant_id: String,
    pub phase: String,
    pub target: String,
    pub options: Map<String, Value>,
    pub state: TaskState,
}

impl TaskDescriptor {
    pub fn new(
        task_id: impl Into<String>,
        tenant_id: impl Into<String>,
        phase: impl Into<String>,
        target: impl Into<String>,
        options: Map<String, Value>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            tenant_id: tenant_id.into(),
            phase: phase.into(),
            target: target.into(),
            options,
            state: TaskState::Queued,
        }
    }

    /// 生成新任务（task_id 为随机 UUID）
    pub fn generate(
        tenant_id: impl Into<String>,
        phase: impl Into<String>,
        target: impl Into<String>,
        options: Map<String, Value>,
    ) -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            tenant_id,
            phase,
            target,
            options,
        )
    }

    /// 存储中的默认哈希键
    pub fn storage_key(&self) -> String {
        format!("task:{}:{}", self.tenant_id, self.task_id)
    }

    /// 从存储哈希解析；缺少必填字段或 options 不是 JSON 对象时视为参数不完整
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, EngineError> {
        let required = |name: &str| -> Result<String, EngineError> {
            fields
                .get(name)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| EngineError::MissingParameters(format!("missing '{}'", name)))
        };

        let options = match fields.get("options").map(|s| s.trim()) {
            None | Some("") => Map::new(),
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => map,
                Ok(Value::Null) => Map::new(),
                _ => {
                    return Err(EngineError::MissingParameters(
                        "'options' is not a JSON object".to_string(),
                    ))
                }
            },
        };

        let state = match fields.get("state") {
            Some(s) => s.parse()?,
            None => TaskState::Queued,
        };

        Ok(Self {
            task_id: required("task_id")?,
            tenant_id: required("tenant_id")?,
            phase: required("phase")?,
            target: required("target")?,
            options,
            state,
        })
    }

    /// 写入存储的哈希字段
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("task_id", self.task_id.clone()),
            ("tenant_id", self.tenant_id.clone()),
            ("phase", self.phase.clone()),
            ("target", self.target.clone()),
            ("options", Value::Object(self.options.clone()).to_string()),
            ("state", self.state.as_str().to_string()),
        ]
    }

    pub fn log_channel(&self) -> String {
        log_channel(&self.tenant_id, &self.task_id)
    }

    pub fn completion_channel(&self) -> String {
        completion_channel(&self.tenant_id, &self.task_id)
    }
}

pub fn log_channel(tenant_id: &str, task_id: &str) -> String {
    format!("logs:{}:{}", tenant_id, task_id)
}

pub fn completion_channel(tenant_id: &str, task_id: &str) -> String {
    format!("complete:{}:{}", tenant_id, task_id)
}

/// 任务终态及其载荷
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
        }
    }

    /// 写入哈希的 (字段, 值)：result 存序列化结果，error 存错误文本
    pub fn stored_field(&self) -> (&'static str, String) {
        match self {
            TaskOutcome::Completed(result) => ("result", result.to_string()),
            TaskOutcome::Failed(error) => ("error", error.clone()),
        }
    }

    /// 发布到完成频道的消息
    pub fn notification(&self, completed_at: &str) -> String {
        match self {
            TaskOutcome::Completed(result) => result.to_string(),
            TaskOutcome::Failed(error) => {
                json!({"error": error, "completed_at": completed_at}).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parse() {
        let env = Envelope::parse(r#"{"task_id":"t1","tenant_id":"acme","key":"task:t1"}"#).unwrap();
        assert_eq!(env.key, "task:t1");
        assert!(matches!(
            Envelope::parse("not json"),
            Err(EngineError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"task_id":"t1","tenant_id":"acme"}"#),
            Err(EngineError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"task_id":"","tenant_id":"acme","key":"k"}"#),
            Err(EngineError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_phase_aliases() {
        assert_eq!(Phase::parse("planning").unwrap(), Phase::Recon);
        assert_eq!(Phase::parse("Reconnaissance").unwrap(), Phase::Recon);
        assert_eq!(Phase::parse("execution").unwrap(), Phase::Exec);
        let err = Phase::parse("report").unwrap_err();
        assert_eq!(err.to_string(), "Phase 'report' not supported");
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(log_channel("acme", "t1"), "logs:acme:t1");
        assert_eq!(completion_channel("acme", "t1"), "complete:acme:t1");
    }

    #[test]
    fn test_descriptor_fields_roundtrip() {
        let mut options = Map::new();
        options.insert("ports".to_string(), json!([22, 80]));
        let d = TaskDescriptor::new("t1", "acme", "recon", "10.0.0.5", options);
        let fields: HashMap<String, String> = d
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(TaskDescriptor::from_fields(&fields).unwrap(), d);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TaskDescriptor::generate("acme", "recon", "10.0.0.5", Map::new());
        let b = TaskDescriptor::generate("acme", "recon", "10.0.0.5", Map::new());
        assert_ne!(a.task_id, b.task_id);
        assert_eq!(a.storage_key(), format!("task:acme:{}", a.task_id));
        assert_eq!(a.state, TaskState::Queued);
    }

    #[test]
    fn test_descriptor_missing_target() {
        let fields: HashMap<String, String> = [("task_id", "t1"), ("tenant_id", "acme"), ("phase", "recon")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let err = TaskDescriptor::from_fields(&fields).unwrap_err();
        assert!(matches!(err, EngineError::MissingParameters(_)));
    }

    #[test]
    fn test_failure_notification_shape() {
        let outcome = TaskOutcome::Failed("Kali MCP server not connected".to_string());
        let v: Value = serde_json::from_str(&outcome.notification("2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(v["error"], "Kali MCP server not connected");
        assert_eq!(v["completed_at"], "2026-01-01T00:00:00Z");
        assert_eq!(outcome.state(), TaskState::Failed);
    }
}
