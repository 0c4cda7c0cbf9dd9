//! 核心层：错误与处置、优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{Disposition, EngineError};
pub use shutdown::{BackendCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
