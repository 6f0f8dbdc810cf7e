//! # unirt-host - 主机参考适配器
//!
//! 在 CPU 上实现全部后端接口：一个平台，若干设备（数量由
//! `UNIRT_HOST_DEVICES` 配置），USM 分配来自进程堆，每个队列
//! 由一个工作线程按提交顺序执行操作。

pub mod adapter;
pub mod context;
pub mod queue;

pub use adapter::{HOST_GLOBAL_MEM_SIZE, HOST_MAX_ALLOC_SIZE, HostAdapter, HostDevice, HostPlatform};
pub use context::{HOST_USM_ALIGNMENT, HostBuffer, HostContext};
pub use queue::{HostEvent, HostQueue};

use std::sync::Arc;
use unirt_core::PlatformRegistry;
use unirt_error::UrResult;

/// 适配器名称
pub const ADAPTER_NAME: &str = "host";

/// 把主机适配器注册到进程级注册表
///
/// 可以重复调用；已经注册时返回 `Ok(false)`。
/// 平台缓存构建之后首次注册返回 `InvalidOperation`。
pub fn register() -> UrResult<bool> {
    PlatformRegistry::global().register_adapter_once(Arc::new(HostAdapter::from_config()))
}
