// UniRT日志系统（Logging System）
//
// 所有 crate 通过 `tracing` 宏记录日志；可执行程序或测试调用
// `init_logging` 安装一个读取 `UNIRT_LOG` 过滤规则的 fmt 订阅者。

use std::fmt::Debug;
use std::sync::Once;
use tracing_subscriber::EnvFilter;
use unirt_error::{UrResult, result_code};

/// 日志过滤规则环境变量
pub const ENV_LOG_FILTER: &str = "UNIRT_LOG";

/// 调用跟踪使用的日志目标
pub const TRACE_TARGET: &str = "unirt::trace";

static INIT_LOGGING: Once = Once::new();

/// 安装全局日志订阅者（幂等）
///
/// 如果进程中已经存在其他订阅者，则保持不变。
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let filter =
            EnvFilter::try_from_env(ENV_LOG_FILTER).unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// 记录一次入口点调用及其结果码
///
/// 只有在配置开启 `print_trace` 时才输出。
pub fn trace_call<T: Debug>(entry: &str, result: &UrResult<T>) {
    if crate::config::print_trace() {
        tracing::info!(
            target: TRACE_TARGET,
            "{}() -> {} {:?}",
            entry,
            result_code(result),
            result
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unirt_error::UrError;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }

    #[test]
    fn test_trace_call_does_not_panic() {
        trace_call("queue_flush", &Ok::<(), UrError>(()));
        trace_call("queue_flush", &Err::<(), UrError>(UrError::InvalidNullHandle));
    }
}
