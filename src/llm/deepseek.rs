//! DeepSeek（OpenAI 兼容端点）

use crate::config::LlmSection;
use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 未配置 base_url 时走官方端点；model 为空时用 deepseek-chat
pub fn create_deepseek_client(llm: &LlmSection, api_key: &str) -> OpenAiClient {
    let model = if llm.model.trim().is_empty() {
        DEEPSEEK_CHAT
    } else {
        llm.model.as_str()
    };
    let base_url = llm.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
    OpenAiClient::new(Some(base_url), model, Some(api_key)).with_request_timeout(llm.timeouts.request)
}
