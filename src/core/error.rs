//! 引擎错误类型与任务处置
//!
//! 与消费循环配合：根据 EngineError 决定丢弃任务（Drop）还是记录失败终态（Fail）。

use thiserror::Error;

/// 引擎运行过程中可能出现的错误（连接、传输、协议、队列、配置等）
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// 目标后端未连接（Display 形如 "Kali MCP server not connected"）
    #[error("{0} not connected")]
    BackendUnavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Missing task parameters: {0}")]
    MissingParameters(String),

    #[error("Phase '{0}' not supported")]
    UnsupportedPhase(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 消费循环对错误的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 记录日志后继续循环，不写任何终态
    Drop,
    /// 记录 failed 终态并发布错误通知
    Fail,
}

impl EngineError {
    /// 信封/参数层面的错误直接丢弃（任务从未进入 running），其余一律记为失败
    pub fn disposition(&self) -> Disposition {
        match self {
            EngineError::MalformedEnvelope(_) | EngineError::MissingParameters(_) => {
                Disposition::Drop
            }
            _ => Disposition::Fail,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_unavailable_message() {
        let err = EngineError::BackendUnavailable("Kali MCP server".to_string());
        assert_eq!(err.to_string(), "Kali MCP server not connected");
    }

    #[test]
    fn test_unsupported_phase_message() {
        let err = EngineError::UnsupportedPhase("report".to_string());
        assert_eq!(err.to_string(), "Phase 'report' not supported");
    }

    #[test]
    fn test_disposition() {
        assert_eq!(
            EngineError::MalformedEnvelope("x".into()).disposition(),
            Disposition::Drop
        );
        assert_eq!(
            EngineError::MissingParameters("phase".into()).disposition(),
            Disposition::Drop
        );
        assert_eq!(
            EngineError::Transport("broken pipe".into()).disposition(),
            Disposition::Fail
        );
    }
}
