//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 只取消 token；消费循环在出队等待处响应，正在执行的任务会跑完并提交终态。
//! 循环退出后由 ShutdownCoordinator 依次执行清理（释放后端连接等），每项有独立超时。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backends::BackendRouter;

const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// 关闭信号：第一次触发的原因会被记住，之后的触发只是重复取消
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }

    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, stopping after the current task");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM, stopping after the current task");
                        manager.shutdown(ShutdownReason::Terminate);
                    }
                    Err(e) => tracing::warn!(error = %e, "Cannot install SIGTERM handler"),
                }
            });
        }
    }
}

/// 退出前的清理项
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanups: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanups: Vec::new(),
            timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, cleanup: T) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// 按注册顺序执行，返回失败（含超时）的项数
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!(
            reason = ?self.manager.reason(),
            count = self.cleanups.len(),
            "Running shutdown cleanup"
        );
        let mut failures = 0;
        for cleanup in &self.cleanups {
            match tokio::time::timeout(self.timeout, cleanup.cleanup()).await {
                Ok(Ok(())) => tracing::info!(cleanup = cleanup.name(), "Cleanup done"),
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(cleanup = cleanup.name(), error = %e, "Cleanup failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(
                        cleanup = cleanup.name(),
                        timeout_secs = self.timeout.as_secs(),
                        "Cleanup timed out"
                    );
                }
            }
        }
        failures
    }
}

/// 释放两个后端连接（知识库子进程、执行后端 HTTP 会话）
pub struct BackendCleanup {
    router: Arc<BackendRouter>,
}

impl BackendCleanup {
    pub fn new(router: Arc<BackendRouter>) -> Self {
        Self { router }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BackendCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.router.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "backends"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::Terminate);
        manager.shutdown(ShutdownReason::Interrupt);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
    }

    struct Flag(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flag"
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_all_and_counts_timeouts() {
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()))
            .with_timeout(Duration::from_millis(20));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Stuck);
        coordinator.register(Flag(called.clone()));
        coordinator.register(BackendCleanup::new(Arc::new(BackendRouter::disconnected())));

        assert_eq!(coordinator.run_cleanup().await, 1);
        assert!(called.load(Ordering::SeqCst));
    }
}
