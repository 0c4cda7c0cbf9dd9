//! Redis 实现：BLPOP 队列 + 任务哈希 + PUBLISH
//!
//! 生产端 RPUSH、消费端 BLPOP，保持先进先出；多个进程竞争同一队列时由 BLPOP 的原子性保证每条信封只被一个消费者拿到。

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::core::EngineError;
use crate::queue::broker::envelope_json;
use crate::queue::{TaskBroker, TaskDescriptor, TaskOutcome, TaskState};

pub struct RedisBroker {
    client: redis::Client,
    /// 普通命令共用的多路复用连接
    conn: MultiplexedConnection,
    queue_key: String,
}

impl RedisBroker {
    pub async fn connect(url: &str, queue_key: impl Into<String>) -> Result<Self, EngineError> {
        let client = redis::Client::open(url)
            .map_err(|e| EngineError::Connection(format!("invalid redis url: {}", e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Connection(format!("redis connect failed: {}", e)))?;
        Ok(Self {
            client,
            conn,
            queue_key: queue_key.into(),
        })
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }
}

#[async_trait]
impl TaskBroker for RedisBroker {
    async fn pop(&self) -> Result<String, EngineError> {
        // BLPOP 会占住连接，单独开一条，避免阻塞日志转发等命令
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        loop {
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&self.queue_key)
                .arg(0)
                .query_async(&mut conn)
                .await?;
            if let Some((_, payload)) = popped {
                return Ok(payload);
            }
        }
    }

    async fn load_task(&self, key: &str) -> Result<HashMap<String, String>, EngineError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn mark_running(&self, key: &str, started_at: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                key,
                &[
                    ("state", TaskState::Running.as_str()),
                    ("started_at", started_at),
                ],
            )
            .await?;
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
        let notification = outcome.notification(completed_at);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                key,
                &[
                    ("state", outcome.state().as_str()),
                    (field, value.as_str()),
                    ("completed_at", completed_at),
                ],
            )
            .ignore()
            .publish(channel, notification)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn submit(&self, key: &str, task: &TaskDescriptor) -> Result<(), EngineError> {
        let mut queued = task.clone();
        queued.state = TaskState::Queued;
        let fields = queued.to_fields();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(key, fields.as_slice())
            .ignore()
            .rpush(&self.queue_key, envelope_json(key, &queued))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
