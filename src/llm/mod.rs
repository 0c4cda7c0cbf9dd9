//! LLM 层：规划协作方的客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::EngineError;

pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

/// 按配置创建规划协作方客户端；非 mock 时缺 API Key 直接报错（启动即退出）
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, EngineError> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = cfg.require_api_key()?;
    let timeout = cfg.llm.timeouts.request;

    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::warn!("Using Mock LLM; plans will be empty unless replies are scripted");
            Ok(Arc::new(MockLlmClient::new()))
        }
        ("deepseek", Some(key)) => {
            tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
            Ok(Arc::new(create_deepseek_client(&cfg.llm, &key)))
        }
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Ok(Arc::new(
                OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key))
                    .with_request_timeout(timeout),
            ))
        }
        (other, _) => Err(EngineError::Config(format!(
            "unknown llm provider '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_rejected() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "llama".to_string();
        cfg.llm.api_key = Some("k".to_string());
        assert!(matches!(
            create_llm_from_config(&cfg),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_mock_provider() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        assert!(create_llm_from_config(&cfg).is_ok());
    }
}
