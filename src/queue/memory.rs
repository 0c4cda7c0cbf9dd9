//! 进程内实现：测试与嵌入式使用（投递与消费在同一进程内）

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::core::EngineError;
use crate::queue::broker::envelope_json;
use crate::queue::{TaskBroker, TaskDescriptor, TaskOutcome, TaskState};

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    tasks: HashMap<String, HashMap<String, String>>,
    published: Vec<(String, String)>,
}

/// 队列、任务哈希与已发布消息都在一把锁里，commit 天然原子
#[derive(Default)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, EngineError> {
        self.inner
            .lock()
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    /// 直接入队原始文本（可以是任意内容）
    pub fn push_raw(&self, raw: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.queue.push_back(raw.into());
        }
        self.notify.notify_one();
    }

    pub fn insert_fields(&self, key: &str, fields: HashMap<String, String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tasks.insert(key.to_string(), fields);
        }
    }

    pub fn task_fields(&self, key: &str) -> Option<HashMap<String, String>> {
        self.inner.lock().ok()?.tasks.get(key).cloned()
    }

    /// 某频道已发布的消息（按发布顺序）
    pub fn published(&self, channel: &str) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .published
                    .iter()
                    .filter(|(c, _)| c == channel)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().map(|i| i.queue.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TaskBroker for InMemoryBroker {
    async fn pop(&self) -> Result<String, EngineError> {
        loop {
            let notified = self.notify.notified();
            if let Some(raw) = self.lock()?.queue.pop_front() {
                return Ok(raw);
            }
            notified.await;
        }
    }

    async fn load_task(&self, key: &str) -> Result<HashMap<String, String>, EngineError> {
        Ok(self.lock()?.tasks.get(key).cloned().unwrap_or_default())
    }

    async fn mark_running(&self, key: &str, started_at: &str) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        let fields = inner.tasks.entry(key.to_string()).or_default();
        fields.insert("state".to_string(), TaskState::Running.as_str().to_string());
        fields.insert("started_at".to_string(), started_at.to_string());
        Ok(())
    }

    async fn commit(
        &self,
        key: &str,
        channel: &str,
        outcome: &TaskOutcome,
        completed_at: &str,
    ) -> Result<(), EngineError> {
        let (field, value) = outcome.stored_field();
        let mut inner = self.lock()?;
        let fields = inner.tasks.entry(key.to_string()).or_default();
        fields.insert("state".to_string(), outcome.state().as_str().to_string());
        fields.insert(field.to_string(), value);
        fields.insert("completed_at".to_string(), completed_at.to_string());
        inner
            .published
            .push((channel.to_string(), outcome.notification(completed_at)));
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), EngineError> {
        self.lock()?
            .published
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn submit(&self, key: &str, task: &TaskDescriptor) -> Result<(), EngineError> {
        let mut queued = task.clone();
        queued.state = TaskState::Queued;
        let fields = queued
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        {
            let mut inner = self.lock()?;
            inner.tasks.insert(key.to_string(), fields);
            inner.queue.push_back(envelope_json(key, &queued));
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let broker = Arc::new(InMemoryBroker::new());
        let b = broker.clone();
        let handle = tokio::spawn(async move { b.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.push_raw("hello");
        let popped = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(popped, "hello");
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let broker = InMemoryBroker::new();
        broker.push_raw("a");
        broker.push_raw("b");
        assert_eq!(broker.pop().await.unwrap(), "a");
        assert_eq!(broker.pop().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_submit_writes_queued_hash() {
        let broker = InMemoryBroker::new();
        let task = TaskDescriptor::new("t1", "acme", "recon", "10.0.0.5", Map::new());
        broker.submit("task:t1", &task).await.unwrap();
        let fields = broker.task_fields("task:t1").unwrap();
        assert_eq!(fields["state"], "queued");
        assert_eq!(broker.pending(), 1);
        let raw = broker.pop().await.unwrap();
        assert!(raw.contains("task:t1"));
    }

    #[tokio::test]
    async fn test_commit_writes_state_and_publishes_once() {
        let broker = InMemoryBroker::new();
        let outcome = TaskOutcome::Failed("boom".to_string());
        broker
            .commit("task:t1", "complete:acme:t1", &outcome, "2026-01-01T00:00:00Z")
            .await
            .unwrap();
        let fields = broker.task_fields("task:t1").unwrap();
        assert_eq!(fields["state"], "failed");
        assert_eq!(fields["error"], "boom");
        assert_eq!(broker.published("complete:acme:t1").len(), 1);
    }
}
