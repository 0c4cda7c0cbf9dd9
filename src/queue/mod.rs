//! 队列层：信封与任务描述、Broker 抽象（Redis / 内存）、任务日志转发、消费循环

pub mod broker;
pub mod consumer;
pub mod log_sink;
pub mod memory;
pub mod redis_broker;
pub mod task;

use std::sync::Arc;

pub use broker::TaskBroker;
pub use consumer::TaskConsumer;
pub use log_sink::{LogLevel, TaskLog};
pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;
pub use task::{
    completion_channel, log_channel, Envelope, Phase, TaskDescriptor, TaskOutcome, TaskState,
};

use crate::config::QueueSection;
use crate::core::EngineError;

/// 进程内队列没有可共享的地址；InMemoryBroker 只能在同一进程内直接构造
const IN_PROCESS_SCHEME: &str = "memory://";

/// 连接跨进程共享的 Redis 队列。
/// `memory://` 被拒绝：投递端与消费端是不同进程，进程内队列里的任务会随进程退出丢失。
pub async fn connect_broker(config: &QueueSection) -> Result<Arc<dyn TaskBroker>, EngineError> {
    if config.redis_url.starts_with(IN_PROCESS_SCHEME) {
        return Err(EngineError::Config(format!(
            "queue.redis_url '{}' is an in-process queue and cannot be shared between processes; point it at Redis",
            config.redis_url
        )));
    }
    let broker = RedisBroker::connect(&config.redis_url, config.queue_key.clone()).await?;
    tracing::info!(queue = %broker.queue_key(), "Connected to task queue");
    Ok(Arc::new(broker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_url_is_refused() {
        let config = QueueSection {
            redis_url: "memory://".to_string(),
            ..QueueSection::default()
        };
        let err = connect_broker(&config).await.err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("in-process queue"), "{}", err);
    }
}
