//! 任务日志转发
//!
//! TaskLog 作为显式上下文在任务调用链中传递：每行 `[LEVEL][phase] message` 先同步写入 tracing，
//! 再经无界通道交给单个转发任务按顺序发布到 `logs:<tenant>:<task>`。
//! finish 关闭通道并等待转发任务把剩余行发完；任务结束（无论成败）都应调用。

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::queue::TaskBroker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

pub fn format_line(level: LogLevel, phase: &str, message: &str) -> String {
    format!("[{}][{}] {}", level, phase, message)
}

pub struct TaskLog {
    task_id: String,
    phase: String,
    tx: Option<mpsc::UnboundedSender<String>>,
    forwarder: Option<JoinHandle<()>>,
}

impl TaskLog {
    /// 绑定到某个频道：之后的每一行都会发布出去
    pub fn attach(
        broker: Arc<dyn TaskBroker>,
        channel: String,
        task_id: impl Into<String>,
        phase: impl Into<String>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = broker.publish(&channel, &line).await {
                    tracing::debug!(channel = %channel, error = %e, "Dropping task log line");
                }
            }
        });
        Self {
            task_id: task_id.into(),
            phase: phase.into(),
            tx: Some(tx),
            forwarder: Some(forwarder),
        }
    }

    /// 只写 tracing，不发布
    pub fn detached(task_id: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            phase: phase.into(),
            tx: None,
            forwarder: None,
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Error, message.as_ref());
    }

    fn emit(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => tracing::info!(task_id = %self.task_id, phase = %self.phase, "{}", message),
            LogLevel::Warn => tracing::warn!(task_id = %self.task_id, phase = %self.phase, "{}", message),
            LogLevel::Error => tracing::error!(task_id = %self.task_id, phase = %self.phase, "{}", message),
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(format_line(level, &self.phase, message));
        }
    }

    pub async fn finish(mut self) {
        self.tx.take();
        if let Some(handle) = self.forwarder.take() {
            if let Err(e) = handle.await {
                tracing::warn!(task_id = %self.task_id, error = %e, "Log forwarder ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryBroker;

    #[tokio::test]
    async fn test_lines_published_in_order() {
        let broker = Arc::new(InMemoryBroker::new());
        let log = TaskLog::attach(broker.clone(), "logs:acme:t1".to_string(), "t1", "recon");
        log.info("first");
        log.warn("second");
        log.error("third");
        log.finish().await;
        assert_eq!(
            broker.published("logs:acme:t1"),
            vec![
                "[INFO][recon] first".to_string(),
                "[WARN][recon] second".to_string(),
                "[ERROR][recon] third".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_detached_publishes_nothing() {
        let log = TaskLog::detached("t1", "exec");
        log.info("only tracing");
        log.finish().await;
    }
}
