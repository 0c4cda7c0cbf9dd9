//! AutoRed worker
//!
//! 入口：初始化日志、加载配置、连接后端与任务队列，运行消费循环直到收到关闭信号。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autored::backends::{BackendKind, BackendRouter};
use autored::config::load_config;
use autored::core::{BackendCleanup, ShutdownCoordinator, ShutdownManager};
use autored::llm::create_llm_from_config;
use autored::observability;
use autored::queue::{connect_broker, TaskConsumer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选：第一个参数为额外配置文件路径
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;

    // 缺少规划协作方凭据时直接退出，不连接任何后端
    let llm = create_llm_from_config(&cfg).context("Planning LLM is not configured")?;

    let router = Arc::new(BackendRouter::initialize(&cfg.backends).await);
    tracing::info!(
        knowledge = router.is_connected(BackendKind::Knowledge),
        execution = router.is_connected(BackendKind::Execution),
        tools = router.whitelist().len(),
        "Backends initialized"
    );

    let broker = connect_broker(&cfg.queue)
        .await
        .context("Failed to connect to task queue")?;

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(manager.clone());
    coordinator.register(BackendCleanup::new(router.clone()));

    let consumer = TaskConsumer::new(broker, router, llm, cfg.app.clone());
    consumer.run(manager.token()).await;

    coordinator.run_cleanup().await;
    Ok(())
}
