//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTORED__*` 覆盖（双下划线表示嵌套，如 `AUTORED__QUEUE__REDIS_URL=redis://cache:6379`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::EngineError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub backends: BackendsSection,
    pub queue: QueueSection,
}

/// [app] 段：迭代上限、结果截断长度
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// recon 阶段 decision → plan → execute 的最大轮数
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// 单步输出写入结果前的最大字符数
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_iterations: default_max_iterations(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

fn default_max_iterations() -> usize {
    10
}

fn default_max_output_chars() -> usize {
    4000
}

/// [llm] 段：规划协作方（OpenAI 兼容端点）
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [backends] 段：两个后端各自可选，缺省即不连接
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendsSection {
    pub knowledge: Option<KnowledgeBackendSection>,
    pub execution: Option<ExecutionBackendSection>,
}

/// [backends.knowledge]：stdio 传输，启动子进程
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeBackendSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// [backends.execution]：HTTP 传输
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionBackendSection {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

/// [queue] 段：共享队列与存储
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    /// `redis://...`；投递端与消费端必须指向同一个 Redis
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            queue_key: default_queue_key(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queue_key() -> String {
    "autored:tasks".to_string()
}

impl AppConfig {
    /// 规划协作方的 API Key：配置优先，其次 DEEPSEEK_API_KEY / OPENAI_API_KEY。
    /// provider = mock 时不需要。缺失视为启动配置错误，进程应直接退出。
    pub fn require_api_key(&self) -> Result<Option<String>, EngineError> {
        if self.llm.provider.eq_ignore_ascii_case("mock") {
            return Ok(None);
        }
        let key = first_key([
            self.llm.api_key.clone(),
            std::env::var("DEEPSEEK_API_KEY").ok(),
            std::env::var("OPENAI_API_KEY").ok(),
        ]);
        match key {
            Some(k) => Ok(Some(k)),
            None => Err(EngineError::Config(
                "no API key for the planning LLM (set llm.api_key, DEEPSEEK_API_KEY or OPENAI_API_KEY)"
                    .to_string(),
            )),
        }
    }
}

/// 按顺序取第一个非空白的 key
fn first_key<I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    candidates
        .into_iter()
        .flatten()
        .find(|k| !k.trim().is_empty())
}

/// 从 config 目录加载配置，环境变量 AUTORED__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTORED__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTORED")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_iterations, 10);
        assert_eq!(cfg.app.max_output_chars, 4000);
        assert_eq!(cfg.queue.queue_key, "autored:tasks");
        assert!(cfg.backends.knowledge.is_none());
        assert!(cfg.backends.execution.is_none());
    }

    #[test]
    fn test_mock_provider_needs_no_key() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        assert_eq!(cfg.require_api_key().unwrap(), None);
    }

    #[test]
    fn test_configured_key_wins() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key = Some("sk-test".to_string());
        assert_eq!(cfg.require_api_key().unwrap(), Some("sk-test".to_string()));
    }

    #[test]
    fn test_blank_keys_are_skipped() {
        assert_eq!(
            first_key([Some("  ".to_string()), Some(String::new()), Some("sk-env".to_string())]),
            Some("sk-env".to_string())
        );
        assert_eq!(first_key([None, Some(String::new()), Some(" ".to_string())]), None);
    }

    #[test]
    fn test_parse_backends_from_toml() {
        let toml = r#"
            [backends.knowledge]
            command = "python3"
            args = ["rag_server.py"]

            [backends.execution]
            url = "http://kali:3001/mcp"
        "#;
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let knowledge = cfg.backends.knowledge.unwrap();
        assert_eq!(knowledge.command, "python3");
        assert_eq!(knowledge.args, vec!["rag_server.py".to_string()]);
        let execution = cfg.backends.execution.unwrap();
        assert_eq!(execution.url, "http://kali:3001/mcp");
        assert_eq!(execution.connect_timeout_secs, 10);
    }
}
