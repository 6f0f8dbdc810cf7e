//! UniRT通用库
//!
//! 提供所有适配器共享的基础设施：进程级配置、日志、可配置的锁原语、
//! 惰性不可变缓存以及带检查的数值转换。

pub mod cache;
pub mod config;
pub mod logging;
pub mod sync;
pub mod utils;

// 重新导出主要类型
pub use cache::ImmutableCache;
pub use config::{ConfigError, RuntimeConfig, print_trace, single_thread_mode};
pub use logging::{init_logging, trace_call};
pub use sync::{
    RawUrMutex, RawUrRwLock, SpinLock, SpinLockGuard, UrMutex, UrMutexGuard, UrReadGuard,
    UrSharedMutex, UrWriteGuard,
};
pub use utils::{UrCast, align_up, is_valid_alignment};
