//! AutoRed - 计划执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与处置、优雅关闭
//! - **llm**: 规划协作方客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **plan**: 计划模型、白名单校验、工具描述目录、回复解析、计划执行器
//! - **backends**: MCP 客户端（stdio / HTTP）、响应归一化、双后端路由
//! - **recon**: 决策者与侦察迭代循环
//! - **queue**: 任务队列（Redis / 内存）、任务日志转发、消费循环
//! - **observability**: tracing 初始化

pub mod backends;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod queue;
pub mod recon;
