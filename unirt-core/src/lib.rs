//! # unirt-core - 统一运行时核心
//!
//! 面向多种加速器后端的统一运行时核心层：
//! - 平台、设备、上下文、队列、事件、缓冲区等句柄模型与引用计数
//! - 进程级适配器注册表与平台缓存
//! - 通用的两阶段属性查询协议
//! - 统一共享内存（USM）分配校验与记录
//! - 队列批处理、事件依赖与完成状态
//!
//! 后端通过 [`adapter`] 中的 trait 接入；[`api`] 提供与 C 接口一一对应的入口点。

mod flags;

pub mod adapter;
pub mod api;
pub mod context;
pub mod device;
pub mod event;
pub mod handle;
pub mod info;
pub mod memory;
pub mod platform;
pub mod queue;
pub mod registry;
pub mod usm;

#[cfg(test)]
mod testing;

pub use adapter::{
    Adapter, AdapterBackend, ContextBackend, DeviceBackend, EventBackend, MemBackend,
    NativeHandle, PlatformBackend, QueueBackend,
};
pub use context::{Context, ContextInfo};
pub use device::{Device, DeviceInfo, DeviceProperties, DeviceType, UsmCapabilities};
pub use event::{CommandType, Event, EventInfo, EventSignal, EventStatus};
pub use handle::{RefCount, RefCounted};
pub use info::{InfoScalar, ReturnHelper};
pub use memory::{Mem, MemFlags};
pub use platform::{Platform, PlatformInfo, PlatformProperties};
pub use queue::{Command, Queue, QueueFlags, QueueInfo, QueueProperties, Submission};
pub use registry::PlatformRegistry;
pub use usm::{
    UsmAdviceFlags, UsmAllocInfo, UsmAllocRequest, UsmAllocation, UsmDesc, UsmDeviceDesc,
    UsmDeviceMemFlags, UsmHostDesc, UsmHostMemFlags, UsmMemFlags, UsmPlacement, UsmPtr, UsmType,
};

// 重新导出错误类型，后端只需依赖本 crate
pub use unirt_error::{UrError, UrResult};
