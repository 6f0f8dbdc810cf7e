// 运行时配置管理（Configuration Management）
//
// 进程级配置在首次访问时从环境变量读取一次，此后不可变：
// - 单线程模式（关闭所有内部加锁）
// - 入口点调用跟踪
// - 队列动态批处理大小
// - 主机适配器暴露的设备数量

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// 单线程模式环境变量，非零整数表示开启
pub const ENV_SINGLE_THREAD_MODE: &str = "UNIRT_SINGLE_THREAD_MODE";
/// 调用跟踪环境变量，非零整数表示开启
pub const ENV_PRINT_TRACE: &str = "UNIRT_PRINT_TRACE";
/// 队列批处理大小环境变量
pub const ENV_QUEUE_BATCH_SIZE: &str = "UNIRT_QUEUE_BATCH_SIZE";
/// 主机设备数量环境变量
pub const ENV_HOST_DEVICES: &str = "UNIRT_HOST_DEVICES";

/// 默认队列批处理大小
pub const DEFAULT_QUEUE_BATCH_SIZE: usize = 16;
/// 队列批处理大小上限
pub const MAX_QUEUE_BATCH_SIZE: usize = 4096;
/// 主机设备数量上限
pub const MAX_HOST_DEVICES: usize = 64;

static GLOBAL_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// 配置错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {key} = {value}")]
    InvalidValue { key: String, value: String },

    #[error("Runtime configuration is already initialized")]
    AlreadyInitialized,
}

/// 进程级运行时配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 单线程模式：调用者保证不会并发调用，所有锁操作变为空操作
    pub single_thread_mode: bool,
    /// 是否记录每个入口点的调用与结果
    pub print_trace: bool,
    /// 队列在自动派发前最多缓存的操作数
    pub queue_batch_size: usize,
    /// 主机适配器暴露的设备数量
    pub host_device_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            single_thread_mode: false,
            print_trace: false,
            queue_batch_size: DEFAULT_QUEUE_BATCH_SIZE,
            host_device_count: 1,
        }
    }
}

impl RuntimeConfig {
    /// 从进程环境变量读取配置
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值查找函数构建配置
    ///
    /// 缺失的键使用默认值；无法解析的值记录警告后使用默认值。
    ///
    /// # 示例
    /// ```
    /// use unirt_common::config::RuntimeConfig;
    ///
    /// let config = RuntimeConfig::from_lookup(|key| match key {
    ///     "UNIRT_SINGLE_THREAD_MODE" => Some("1".to_string()),
    ///     _ => None,
    /// });
    /// assert!(config.single_thread_mode);
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            single_thread_mode: lookup(ENV_SINGLE_THREAD_MODE)
                .map(|v| parse_flag(ENV_SINGLE_THREAD_MODE, &v, defaults.single_thread_mode))
                .unwrap_or(defaults.single_thread_mode),
            print_trace: lookup(ENV_PRINT_TRACE)
                .map(|v| parse_flag(ENV_PRINT_TRACE, &v, defaults.print_trace))
                .unwrap_or(defaults.print_trace),
            queue_batch_size: lookup(ENV_QUEUE_BATCH_SIZE)
                .map(|v| parse_count(ENV_QUEUE_BATCH_SIZE, &v, defaults.queue_batch_size))
                .unwrap_or(defaults.queue_batch_size),
            host_device_count: lookup(ENV_HOST_DEVICES)
                .map(|v| parse_count(ENV_HOST_DEVICES, &v, defaults.host_device_count))
                .unwrap_or(defaults.host_device_count),
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_batch_size == 0 || self.queue_batch_size > MAX_QUEUE_BATCH_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "queue_batch_size".to_string(),
                value: self.queue_batch_size.to_string(),
            });
        }
        if self.host_device_count == 0 || self.host_device_count > MAX_HOST_DEVICES {
            return Err(ConfigError::InvalidValue {
                key: "host_device_count".to_string(),
                value: self.host_device_count.to_string(),
            });
        }
        Ok(())
    }

    /// 获取全局配置（单例），首次调用时从环境读取
    pub fn global() -> &'static RuntimeConfig {
        GLOBAL_CONFIG.get_or_init(|| {
            let config = Self::from_env();
            match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    tracing::warn!("{}, falling back to default configuration", e);
                    Self::default()
                }
            }
        })
    }

    /// 在首次使用前安装显式配置
    ///
    /// 配置一旦被读取就不可再修改，此时返回 `AlreadyInitialized`。
    pub fn install(config: RuntimeConfig) -> Result<(), ConfigError> {
        config.validate()?;
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| ConfigError::AlreadyInitialized)
    }

    /// 全局配置是否已经确定
    pub fn is_initialized() -> bool {
        GLOBAL_CONFIG.get().is_some()
    }
}

/// 是否处于单线程模式
#[inline]
pub fn single_thread_mode() -> bool {
    RuntimeConfig::global().single_thread_mode
}

/// 是否开启入口点调用跟踪
#[inline]
pub fn print_trace() -> bool {
    RuntimeConfig::global().print_trace
}

fn parse_flag(key: &str, value: &str, default: bool) -> bool {
    match value.trim().parse::<i64>() {
        Ok(v) => v != 0,
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: expected an integer", key, value);
            default
        }
    }
}

fn parse_count(key: &str, value: &str, default: usize) -> usize {
    match value.trim().parse::<usize>() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: expected a non-negative integer", key, value);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config, RuntimeConfig::default());
        assert!(!config.single_thread_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flag_parsing() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            (ENV_SINGLE_THREAD_MODE, "1"),
            (ENV_PRINT_TRACE, " 0 "),
        ]));
        assert!(config.single_thread_mode);
        assert!(!config.print_trace);

        let config = RuntimeConfig::from_lookup(lookup_from(&[(ENV_SINGLE_THREAD_MODE, "-3")]));
        assert!(config.single_thread_mode);
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            (ENV_SINGLE_THREAD_MODE, "yes"),
            (ENV_QUEUE_BATCH_SIZE, "many"),
        ]));
        assert!(!config.single_thread_mode);
        assert_eq!(config.queue_batch_size, DEFAULT_QUEUE_BATCH_SIZE);
    }

    #[test]
    fn test_counts() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            (ENV_QUEUE_BATCH_SIZE, "4"),
            (ENV_HOST_DEVICES, "3"),
        ]));
        assert_eq!(config.queue_batch_size, 4);
        assert_eq!(config.host_device_count, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = RuntimeConfig {
            queue_batch_size: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_too_many_devices() {
        let config = RuntimeConfig {
            host_device_count: MAX_HOST_DEVICES + 1,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"print_trace": true}"#).unwrap();
        assert!(config.print_trace);
        assert_eq!(config.queue_batch_size, DEFAULT_QUEUE_BATCH_SIZE);
    }

    #[test]
    fn test_install_after_first_use_fails() {
        let _ = RuntimeConfig::global();
        assert_eq!(
            RuntimeConfig::install(RuntimeConfig::default()),
            Err(ConfigError::AlreadyInitialized)
        );
        assert!(RuntimeConfig::is_initialized());
    }
}
