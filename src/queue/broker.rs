//! 共享队列 + 键值存储 + 发布频道的抽象

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::EngineError;
use crate::queue::{TaskDescriptor, TaskOutcome};

#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// 阻塞弹出下一条原始信封（无限等待，先进先出）
    async fn pop(&self) -> Result<String, EngineError>;

    /// 读取任务哈希；键不存在时返回空表
    async fn load_task(&self, key: &str) -> Result<HashMap<String, String>, EngineError>;

    /// state=running，并记录 started_at
    async fn mark_running(&self, key: &str, started_at: &str) -> Result<(), EngineError>;

    /// 在同一事务里写入终态、result/error、completed_at，并向完成频道发布通知
    async fn commit(
        &self,
        key: &str,
        channel: &str,
        outcome: &TaskOutcome,
        completed_at: &str,
    ) -> Result<(), EngineError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), EngineError>;

    /// 生产端：写入任务哈希（state=queued）并入队信封
    async fn submit(&self, key: &str, task: &TaskDescriptor) -> Result<(), EngineError>;
}

/// 入队用的信封 JSON
pub fn envelope_json(key: &str, task: &TaskDescriptor) -> String {
    serde_json::json!({
        "task_id": task.task_id,
        "tenant_id": task.tenant_id,
        "key": key,
    })
    .to_string()
}
