//! 上下文
//!
//! 上下文把同一平台上的一组设备绑定在一起，并拥有在其中创建的
//! 统一共享内存分配。每个存活的分配都持有上下文的一次内部引用，
//! 因此上下文不会在其分配全部释放之前被销毁。

use crate::adapter::{ContextBackend, NativeHandle};
use crate::device::Device;
use crate::handle::{RefCount, RefCounted};
use crate::info::ReturnHelper;
use crate::platform::{Platform, non_null_handle};
use crate::usm::{
    UsmAllocInfo, UsmAllocRequest, UsmAllocation, UsmDesc, UsmPlacement, UsmPtr, UsmType,
    validate_usm_size,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use unirt_common::{UrCast, UrSharedMutex};
use unirt_error::{UrError, UrResult, ur_assert};

/// 上下文查询属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ContextInfo {
    NumDevices = 1,
    Devices = 2,
    ReferenceCount = 3,
}

/// 上下文句柄
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

struct ContextInner {
    ref_count: RefCount,
    platform: Platform,
    devices: Vec<Device>,
    backend: Box<dyn ContextBackend>,
    /// 以基地址为键的分配记录
    allocations: UrSharedMutex<BTreeMap<usize, UsmAllocation>>,
}

impl Context {
    /// 创建包含给定设备的上下文
    ///
    /// 设备必须来自同一个平台；重复的设备只保留一个。
    pub fn create(devices: &[Device]) -> UrResult<Context> {
        let first = devices.first().ok_or(UrError::InvalidValue)?;
        let platform = first.platform()?;

        let mut unique: Vec<Device> = Vec::with_capacity(devices.len());
        for device in devices {
            ur_assert!(device.platform()?.same_as(&platform), UrError::InvalidDevice);
            if !unique.iter().any(|d| d.same_as(device)) {
                unique.push(device.clone());
            }
        }

        let backends: Vec<_> = unique.iter().map(|d| Arc::clone(d.backend())).collect();
        let backend = platform.backend().create_context(&backends)?;
        tracing::debug!("Created context with {} devices", unique.len());

        Ok(Self(Arc::new(ContextInner {
            ref_count: RefCount::new(),
            platform,
            devices: unique,
            backend,
            allocations: UrSharedMutex::new(BTreeMap::new()),
        })))
    }

    pub fn platform(&self) -> &Platform {
        &self.0.platform
    }

    pub fn devices(&self) -> &[Device] {
        &self.0.devices
    }

    /// 设备是否属于此上下文
    pub fn contains_device(&self, device: &Device) -> bool {
        self.0.devices.iter().any(|d| d.same_as(device))
    }

    pub(crate) fn backend(&self) -> &dyn ContextBackend {
        self.0.backend.as_ref()
    }

    pub fn native_handle(&self) -> UrResult<NativeHandle> {
        self.ensure_alive()?;
        non_null_handle(self.0.backend.native_handle())
    }

    /// 两阶段属性查询
    pub fn get_info(&self, prop: ContextInfo, ret: ReturnHelper<'_>) -> UrResult {
        self.ensure_alive()?;
        match prop {
            ContextInfo::NumDevices => {
                let count: u32 = u32::try_from(self.0.devices.len())
                    .map_err(|_| UrError::InvalidValue)?;
                ret.scalar(count)
            }
            ContextInfo::Devices => {
                let ids: Vec<usize> = self.0.devices.iter().map(Device::handle_id).collect();
                ret.array(&ids)
            }
            ContextInfo::ReferenceCount => ret.scalar(self.reference_count()),
        }
    }

    /// 上下文内最大的单次分配字节数
    fn max_alloc_size(&self) -> UrResult<u64> {
        let mut limit = 0;
        for device in &self.0.devices {
            limit = limit.max(device.max_mem_alloc_size()?);
        }
        Ok(limit)
    }

    /// 分配统一共享内存
    ///
    /// 校验顺序：设备归属、大小、描述符、设备能力。任何一步失败都不会分配内存。
    /// 设备和共享分配必须指定设备。
    pub fn usm_alloc(
        &self,
        usm_type: UsmType,
        device: Option<&Device>,
        desc: Option<&UsmDesc>,
        size: usize,
    ) -> UrResult<UsmPtr> {
        self.ensure_alive()?;
        let default_desc = UsmDesc::default();
        let desc = desc.unwrap_or(&default_desc);

        if let Some(device) = device {
            ur_assert!(self.contains_device(device), UrError::InvalidDevice);
        }
        let bound_device = match usm_type {
            UsmType::Host => None,
            UsmType::Device | UsmType::Shared => Some(device.ok_or(UrError::InvalidNullHandle)?),
            UsmType::Unknown => return Err(UrError::InvalidEnumeration),
        };

        let limit = match bound_device {
            Some(device) => device.max_mem_alloc_size()?,
            None => self.max_alloc_size()?,
        };
        validate_usm_size(size, limit)?;
        desc.validate()?;
        let placement = self.resolve_placement(usm_type, bound_device)?;

        let request = UsmAllocRequest {
            placement,
            device: bound_device.map(Device::backend),
            size,
            align: desc.align.ur_cast(),
            desc,
        };
        let ptr = self.0.backend.usm_alloc(&request)?;
        if ptr.is_null() {
            tracing::error!("Backend returned a null USM pointer for {} bytes", size);
            return Err(UrError::OutOfResources);
        }
        debug_assert!(request.align == 0 || ptr.addr() % request.align == 0);

        if let Err(e) = self.retain() {
            let _ = self.0.backend.usm_free(ptr);
            return Err(e);
        }
        self.0.allocations.write().insert(
            ptr.addr(),
            UsmAllocation {
                ptr,
                size,
                placement,
                device: bound_device.cloned(),
                advice: desc.advice,
            },
        );
        tracing::trace!("USM {:?} allocation {:#x} ({} bytes)", placement, ptr.addr(), size);
        Ok(ptr)
    }

    fn resolve_placement(
        &self,
        usm_type: UsmType,
        device: Option<&Device>,
    ) -> UrResult<UsmPlacement> {
        match (usm_type, device) {
            (UsmType::Host, _) => {
                for device in &self.0.devices {
                    if !device.properties()?.usm_host_support.is_empty() {
                        return Ok(UsmPlacement::Host);
                    }
                }
                Err(UrError::UnsupportedFeature)
            }
            (UsmType::Device, Some(device)) => {
                ur_assert!(
                    !device.properties()?.usm_device_support.is_empty(),
                    UrError::UnsupportedFeature
                );
                Ok(UsmPlacement::Device)
            }
            (UsmType::Shared, Some(device)) => {
                let props = device.properties()?;
                if !props.usm_single_shared_support.is_empty() {
                    Ok(UsmPlacement::SharedSingleDevice)
                } else if !props.usm_cross_shared_support.is_empty() {
                    Ok(UsmPlacement::SharedCrossDevice)
                } else {
                    Err(UrError::UnsupportedFeature)
                }
            }
            _ => Err(UrError::InvalidNullHandle),
        }
    }

    /// 释放统一共享内存
    pub fn usm_free(&self, ptr: UsmPtr) -> UrResult {
        self.ensure_alive()?;
        ur_assert!(!ptr.is_null(), UrError::InvalidNullPointer);
        let allocation = self
            .0
            .allocations
            .write()
            .remove(&ptr.addr())
            .ok_or(UrError::InvalidMemObject)?;

        let freed = self.0.backend.usm_free(allocation.ptr);
        if let Err(e) = freed {
            tracing::warn!("Backend failed to free {:#x}: {}", ptr.addr(), e);
        }
        let released = self.release();
        freed.and(released)
    }

    /// 查找包含 `ptr` 的分配
    pub fn usm_allocation(&self, ptr: UsmPtr) -> Option<UsmAllocation> {
        let allocations = self.0.allocations.read();
        allocations
            .range(..=ptr.addr())
            .next_back()
            .map(|(_, allocation)| allocation)
            .filter(|allocation| allocation.contains_range(ptr, 1))
            .cloned()
    }

    /// 确认 `[ptr, ptr + len)` 完全落在此上下文的某个分配内
    pub(crate) fn check_usm_range(&self, ptr: UsmPtr, len: usize) -> UrResult {
        match self.usm_allocation(ptr) {
            Some(allocation) if allocation.contains_range(ptr, len) => Ok(()),
            _ => Err(UrError::InvalidValue),
        }
    }

    /// 存活的分配数量
    pub fn allocation_count(&self) -> usize {
        self.0.allocations.read().len()
    }

    /// 查询分配信息；非本上下文的指针类型为 `Unknown`
    pub fn usm_get_alloc_info(
        &self,
        ptr: UsmPtr,
        prop: UsmAllocInfo,
        ret: ReturnHelper<'_>,
    ) -> UrResult {
        self.ensure_alive()?;
        let allocation = self.usm_allocation(ptr);
        match (prop, allocation) {
            (UsmAllocInfo::Type, None) => ret.scalar(UsmType::Unknown),
            (UsmAllocInfo::Type, Some(a)) => ret.scalar(a.placement.usm_type()),
            (UsmAllocInfo::BasePtr, Some(a)) => ret.scalar(a.ptr),
            (UsmAllocInfo::Size, Some(a)) => ret.scalar(a.size),
            (UsmAllocInfo::Device, Some(a)) => {
                ret.scalar(a.device.as_ref().map_or(0, Device::handle_id))
            }
            (_, None) => Err(UrError::InvalidValue),
        }
    }

    /// 句柄标识，用于在查询结果中引用上下文
    pub fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// 是否为同一个上下文对象
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl RefCounted for Context {
    const INVALID_HANDLE: UrError = UrError::InvalidContext;

    fn ref_count(&self) -> &RefCount {
        &self.0.ref_count
    }

    fn on_destroy(&self) {
        tracing::debug!("Destroying context {:#x}", self.handle_id());
        self.0.backend.release();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &format_args!("{:#x}", self.handle_id()))
            .field("devices", &self.0.devices.len())
            .field("ref_count", &self.0.ref_count.load())
            .finish()
    }
}
