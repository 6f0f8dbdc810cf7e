//! 平台
//!
//! 平台对象由注册表创建并拥有，在注册表拆除之前一直有效，不做引用计数。
//! 属性和设备列表在第一次访问时从后端读取并缓存。

use crate::adapter::{Adapter, AdapterBackend, NativeHandle, PlatformBackend};
use crate::device::{Device, DeviceType};
use crate::info::ReturnHelper;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use unirt_common::ImmutableCache;
use unirt_error::{UrError, UrResult};

/// 平台属性
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProperties {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub extensions: String,
    pub profile: String,
    pub backend: AdapterBackend,
}

/// 平台查询属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PlatformInfo {
    Name = 1,
    Vendor = 2,
    Version = 3,
    Extensions = 4,
    Profile = 5,
    Backend = 6,
}

/// 平台句柄
#[derive(Clone)]
pub struct Platform(Arc<PlatformInner>);

pub(crate) struct PlatformInner {
    adapter: Weak<dyn Adapter>,
    backend: Arc<dyn PlatformBackend>,
    properties: ImmutableCache<PlatformProperties>,
    devices: ImmutableCache<Vec<Device>>,
}

impl Platform {
    pub(crate) fn new(adapter: &Arc<dyn Adapter>, backend: Arc<dyn PlatformBackend>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PlatformInner>| {
            let props_backend = Arc::clone(&backend);
            let devices_backend = Arc::clone(&backend);
            let owner = weak.clone();
            PlatformInner {
                adapter: Arc::downgrade(adapter),
                backend,
                properties: ImmutableCache::new(move |props| props_backend.query_properties(props)),
                devices: ImmutableCache::new(move |devices: &mut Vec<Device>| {
                    for device in devices_backend.enumerate_devices()? {
                        devices.push(Device::new(owner.clone(), device));
                    }
                    tracing::debug!("Enumerated {} devices", devices.len());
                    Ok(())
                }),
            }
        });
        Self(inner)
    }

    pub(crate) fn from_inner(inner: Arc<PlatformInner>) -> Self {
        Self(inner)
    }

    /// 所属适配器；注册表拆除后返回 `Uninitialized`
    pub fn adapter(&self) -> UrResult<Arc<dyn Adapter>> {
        self.0.adapter.upgrade().ok_or(UrError::Uninitialized)
    }

    /// 平台属性（缓存）
    pub fn properties(&self) -> UrResult<&PlatformProperties> {
        self.ensure_live()?;
        self.0.properties.get()
    }

    /// 平台上的所有设备（缓存）
    pub fn devices(&self) -> UrResult<&[Device]> {
        self.ensure_live()?;
        self.0.devices.get().map(Vec::as_slice)
    }

    /// 按类型筛选设备
    ///
    /// `All` 返回全部设备，`Default` 返回第一个设备。
    pub fn devices_of_type(&self, device_type: DeviceType) -> UrResult<Vec<Device>> {
        let devices = self.devices()?;
        match device_type {
            DeviceType::All => Ok(devices.to_vec()),
            DeviceType::Default => Ok(devices.iter().take(1).cloned().collect()),
            wanted => {
                let mut matched = Vec::new();
                for device in devices {
                    if device.properties()?.device_type == wanted {
                        matched.push(device.clone());
                    }
                }
                Ok(matched)
            }
        }
    }

    /// 注册表拆除后平台不再可用
    pub(crate) fn ensure_live(&self) -> UrResult {
        if self.0.adapter.strong_count() == 0 {
            Err(UrError::Uninitialized)
        } else {
            Ok(())
        }
    }

    pub fn native_handle(&self) -> UrResult<NativeHandle> {
        self.ensure_live()?;
        non_null_handle(self.0.backend.native_handle())
    }

    /// 两阶段属性查询
    pub fn get_info(&self, prop: PlatformInfo, ret: ReturnHelper<'_>) -> UrResult {
        let props = self.properties()?;
        match prop {
            PlatformInfo::Name => ret.string(&props.name),
            PlatformInfo::Vendor => ret.string(&props.vendor),
            PlatformInfo::Version => ret.string(&props.version),
            PlatformInfo::Extensions => ret.string(&props.extensions),
            PlatformInfo::Profile => ret.string(&props.profile),
            PlatformInfo::Backend => ret.scalar(props.backend),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn PlatformBackend> {
        &self.0.backend
    }

    /// 句柄标识，用于在查询结果中引用平台
    pub fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// 是否为同一个平台对象
    pub fn same_as(&self, other: &Platform) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("id", &format_args!("{:#x}", self.handle_id()))
            .finish()
    }
}

/// 后端返回空原生句柄说明后端实现有误
pub(crate) fn non_null_handle(handle: NativeHandle) -> UrResult<NativeHandle> {
    if handle.is_null() {
        tracing::error!("Backend returned a null native handle");
        Err(UrError::Unknown)
    } else {
        Ok(handle)
    }
}
