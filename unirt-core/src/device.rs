//! 设备
//!
//! 设备归属于平台，生命周期与平台相同。

use bitflags::bitflags;
use crate::adapter::{DeviceBackend, NativeHandle};
use crate::info::{InfoScalar, ReturnHelper};
use crate::platform::{Platform, PlatformInner, non_null_handle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use unirt_common::ImmutableCache;
use unirt_error::{UrError, UrResult};

bitflags! {
    /// 设备对某类统一共享内存的支持能力
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UsmCapabilities: u32 {
        const ACCESS = 1 << 0;
        const ATOMIC_ACCESS = 1 << 1;
        const CONCURRENT_ACCESS = 1 << 2;
        const CONCURRENT_ATOMIC_ACCESS = 1 << 3;
    }
}

/// 设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum DeviceType {
    /// 平台的默认设备
    #[default]
    Default = 1,
    All = 2,
    Gpu = 3,
    Cpu = 4,
    Fpga = 5,
    Mca = 6,
    Vpu = 7,
}

impl InfoScalar for DeviceType {
    const SIZE: usize = std::mem::size_of::<u32>();

    fn write_ne(self, out: &mut [u8]) {
        (self as u32).write_ne(out);
    }
}

/// 设备属性
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub device_type: DeviceType,
    pub name: String,
    pub vendor: String,
    pub driver_version: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub max_compute_units: u32,
    /// 每一维的最大工作项数，维数即其长度
    pub max_work_item_sizes: Vec<u32>,
    pub max_work_group_size: usize,
    pub global_mem_size: u64,
    pub max_mem_alloc_size: u64,
    /// 内存基地址对齐（字节）
    pub mem_base_addr_align: u32,
    pub host_unified_memory: bool,
    pub usm_host_support: UsmCapabilities,
    pub usm_device_support: UsmCapabilities,
    pub usm_single_shared_support: UsmCapabilities,
    pub usm_cross_shared_support: UsmCapabilities,
    pub usm_system_shared_support: UsmCapabilities,
}

/// 设备查询属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceInfo {
    Type = 0,
    VendorId = 1,
    DeviceId = 2,
    MaxComputeUnits = 3,
    MaxWorkItemDimensions = 4,
    MaxWorkItemSizes = 5,
    MaxWorkGroupSize = 6,
    GlobalMemSize = 7,
    MaxMemAllocSize = 8,
    MemBaseAddrAlign = 9,
    Name = 10,
    Vendor = 11,
    DriverVersion = 12,
    Platform = 13,
    HostUnifiedMemory = 14,
    UsmHostSupport = 15,
    UsmDeviceSupport = 16,
    UsmSingleSharedSupport = 17,
    UsmCrossSharedSupport = 18,
    UsmSystemSharedSupport = 19,
}

/// 设备句柄
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

struct DeviceInner {
    platform: Weak<PlatformInner>,
    backend: Arc<dyn DeviceBackend>,
    properties: ImmutableCache<DeviceProperties>,
}

impl Device {
    pub(crate) fn new(platform: Weak<PlatformInner>, backend: Arc<dyn DeviceBackend>) -> Self {
        let props_backend = Arc::clone(&backend);
        Self(Arc::new(DeviceInner {
            platform,
            backend,
            properties: ImmutableCache::new(move |props| props_backend.query_properties(props)),
        }))
    }

    /// 所属平台；注册表拆除后返回 `Uninitialized`
    pub fn platform(&self) -> UrResult<Platform> {
        self.0
            .platform
            .upgrade()
            .map(Platform::from_inner)
            .ok_or(UrError::Uninitialized)
    }

    /// 设备属性（缓存）
    pub fn properties(&self) -> UrResult<&DeviceProperties> {
        self.platform()?.ensure_live()?;
        self.0.properties.get()
    }

    /// 单次分配的最大字节数
    pub fn max_mem_alloc_size(&self) -> UrResult<u64> {
        Ok(self.properties()?.max_mem_alloc_size)
    }

    pub fn native_handle(&self) -> UrResult<NativeHandle> {
        self.platform()?.ensure_live()?;
        non_null_handle(self.0.backend.native_handle())
    }

    /// 两阶段属性查询
    pub fn get_info(&self, prop: DeviceInfo, ret: ReturnHelper<'_>) -> UrResult {
        let props = self.properties()?;
        match prop {
            DeviceInfo::Type => ret.scalar(props.device_type),
            DeviceInfo::VendorId => ret.scalar(props.vendor_id),
            DeviceInfo::DeviceId => ret.scalar(props.device_id),
            DeviceInfo::MaxComputeUnits => ret.scalar(props.max_compute_units),
            DeviceInfo::MaxWorkItemDimensions => {
                let dims = u32::try_from(props.max_work_item_sizes.len())
                    .map_err(|_| UrError::InvalidValue)?;
                ret.scalar(dims)
            }
            DeviceInfo::MaxWorkItemSizes => {
                ret.array_as::<usize, u32>(&props.max_work_item_sizes)
            }
            DeviceInfo::MaxWorkGroupSize => ret.scalar(props.max_work_group_size),
            DeviceInfo::GlobalMemSize => ret.scalar(props.global_mem_size),
            DeviceInfo::MaxMemAllocSize => ret.scalar(props.max_mem_alloc_size),
            DeviceInfo::MemBaseAddrAlign => ret.scalar(props.mem_base_addr_align),
            DeviceInfo::Name => ret.string(&props.name),
            DeviceInfo::Vendor => ret.string(&props.vendor),
            DeviceInfo::DriverVersion => ret.string(&props.driver_version),
            DeviceInfo::Platform => ret.scalar(self.platform()?.handle_id()),
            DeviceInfo::HostUnifiedMemory => ret.scalar(props.host_unified_memory),
            DeviceInfo::UsmHostSupport => ret.scalar(props.usm_host_support),
            DeviceInfo::UsmDeviceSupport => ret.scalar(props.usm_device_support),
            DeviceInfo::UsmSingleSharedSupport => ret.scalar(props.usm_single_shared_support),
            DeviceInfo::UsmCrossSharedSupport => ret.scalar(props.usm_cross_shared_support),
            DeviceInfo::UsmSystemSharedSupport => ret.scalar(props.usm_system_shared_support),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.0.backend
    }

    /// 句柄标识，用于在查询结果中引用设备
    pub fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// 是否为同一个设备对象
    pub fn same_as(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &format_args!("{:#x}", self.handle_id()))
            .finish()
    }
}
