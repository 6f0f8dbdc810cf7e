//! 后端适配器接口
//!
//! 每个后端（主机参考实现或真实加速器驱动）实现这一组 trait，
//! 核心层负责参数校验、引用计数、属性缓存和操作批处理，
//! 后端只需要完成真正的资源分配与执行。

use crate::device::DeviceProperties;
use crate::memory::MemFlags;
use crate::platform::PlatformProperties;
use crate::queue::{QueueProperties, Submission};
use crate::usm::{UsmAllocRequest, UsmPtr};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use unirt_error::UrResult;

/// 后端原生对象句柄
///
/// 只用于与后端原生接口互操作，有效对象的原生句柄永远不为空。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NativeHandle(usize);

impl NativeHandle {
    /// 空句柄
    pub const NULL: Self = Self(0);

    /// 由原始值构造
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// 以对象地址作为句柄
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<u8>() as usize)
    }

    /// 原始值
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// 是否为空
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// 后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum AdapterBackend {
    #[default]
    Unknown = 0,
    LevelZero = 1,
    OpenCl = 2,
    Cuda = 3,
    Hip = 4,
    NativeCpu = 5,
}

impl crate::info::InfoScalar for AdapterBackend {
    const SIZE: usize = std::mem::size_of::<u32>();

    fn write_ne(self, out: &mut [u8]) {
        crate::info::InfoScalar::write_ne(self as u32, out);
    }
}

/// 后端适配器
pub trait Adapter: Send + Sync {
    /// 适配器名称
    fn name(&self) -> &str;

    /// 后端种类
    fn backend(&self) -> AdapterBackend;

    /// 枚举后端平台
    ///
    /// 只在平台缓存构建时调用一次。返回错误时注册表记录警告并跳过该适配器。
    fn enumerate_platforms(&self) -> UrResult<Vec<Arc<dyn PlatformBackend>>>;

    /// 释放后端的进程级资源
    fn tear_down(&self) {}
}

/// 后端平台
pub trait PlatformBackend: Send + Sync {
    fn native_handle(&self) -> NativeHandle;

    /// 填充平台属性，结果会被缓存
    fn query_properties(&self, props: &mut PlatformProperties) -> UrResult;

    /// 枚举设备，结果会被缓存
    fn enumerate_devices(&self) -> UrResult<Vec<Arc<dyn DeviceBackend>>>;

    /// 创建包含给定设备的上下文
    fn create_context(&self, devices: &[Arc<dyn DeviceBackend>])
    -> UrResult<Box<dyn ContextBackend>>;
}

/// 后端设备
pub trait DeviceBackend: Send + Sync {
    fn native_handle(&self) -> NativeHandle;

    /// 填充设备属性，结果会被缓存
    fn query_properties(&self, props: &mut DeviceProperties) -> UrResult;

    fn as_any(&self) -> &dyn Any;
}

/// 后端上下文
pub trait ContextBackend: Send + Sync {
    fn native_handle(&self) -> NativeHandle;

    /// 分配统一共享内存
    ///
    /// 请求已经通过核心层校验。内存建议必须整体生效，
    /// 无法生效时整个分配失败，不能部分应用。
    fn usm_alloc(&self, request: &UsmAllocRequest<'_>) -> UrResult<UsmPtr>;

    /// 释放 `usm_alloc` 返回的内存
    fn usm_free(&self, ptr: UsmPtr) -> UrResult;

    /// 创建缓冲区；`host_data` 存在时用其初始化内容
    fn create_buffer(
        &self,
        flags: MemFlags,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> UrResult<Arc<dyn MemBackend>>;

    /// 在指定设备上创建队列
    fn create_queue(
        &self,
        device: &Arc<dyn DeviceBackend>,
        props: &QueueProperties,
    ) -> UrResult<Box<dyn QueueBackend>>;

    /// 上下文销毁时调用
    fn release(&self) {}
}

/// 后端内存对象
pub trait MemBackend: Send + Sync {
    fn native_handle(&self) -> NativeHandle;

    fn size(&self) -> usize;

    fn as_any(&self) -> &dyn Any;

    fn release(&self) {}
}

/// 后端队列
pub trait QueueBackend: Send + Sync {
    fn native_handle(&self) -> NativeHandle;

    /// 为即将入队的操作创建后端事件
    fn create_event(&self) -> UrResult<Box<dyn EventBackend>>;

    /// 按顺序提交一批操作
    ///
    /// 每个 `Submission` 的信号必须最终完成；信号被丢弃时以错误完成。
    fn submit(&self, batch: Vec<Submission>) -> UrResult;

    /// 阻塞到所有已提交的操作完成
    fn finish(&self) -> UrResult;

    /// 是否没有正在执行的操作
    fn is_idle(&self) -> bool;

    /// 队列销毁时调用，之前提交的操作仍需完成
    fn release(&self) {}
}

/// 后端事件
pub trait EventBackend: Send + Sync {
    fn native_handle(&self) -> NativeHandle;

    fn release(&self) {}
}
