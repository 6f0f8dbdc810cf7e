//! 主机适配器、平台与设备

use crate::ADAPTER_NAME;
use crate::context::HostContext;
use std::any::Any;
use std::sync::Arc;
use unirt_common::RuntimeConfig;
use unirt_core::{
    Adapter, AdapterBackend, ContextBackend, DeviceBackend, DeviceProperties, DeviceType,
    NativeHandle, PlatformBackend, PlatformProperties, UsmCapabilities,
};
use unirt_error::UrResult;

/// 单次分配上限（1 GiB）
pub const HOST_MAX_ALLOC_SIZE: u64 = 1 << 30;
/// 报告的全局内存大小（8 GiB）
pub const HOST_GLOBAL_MEM_SIZE: u64 = 8 << 30;

const HOST_MAX_WORK_ITEM_SIZES: [u32; 3] = [1024, 1024, 1024];
const HOST_MAX_WORK_GROUP_SIZE: usize = 1024;

/// 主机适配器
#[derive(Debug)]
pub struct HostAdapter {
    device_count: usize,
}

impl HostAdapter {
    pub fn new(device_count: usize) -> Self {
        Self { device_count }
    }

    /// 按运行时配置决定设备数量
    pub fn from_config() -> Self {
        Self::new(RuntimeConfig::global().host_device_count)
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }
}

impl Adapter for HostAdapter {
    fn name(&self) -> &str {
        ADAPTER_NAME
    }

    fn backend(&self) -> AdapterBackend {
        AdapterBackend::NativeCpu
    }

    fn enumerate_platforms(&self) -> UrResult<Vec<Arc<dyn PlatformBackend>>> {
        tracing::debug!("Host adapter exposes {} devices", self.device_count);
        let platform: Arc<dyn PlatformBackend> = Arc::new(HostPlatform::new(self.device_count));
        Ok(vec![platform])
    }

    fn tear_down(&self) {
        tracing::debug!("Host adapter torn down");
    }
}

/// 主机平台
#[derive(Debug)]
pub struct HostPlatform {
    devices: Vec<Arc<HostDevice>>,
}

impl HostPlatform {
    pub fn new(device_count: usize) -> Self {
        Self {
            devices: (0..device_count)
                .map(|index| Arc::new(HostDevice::new(index)))
                .collect(),
        }
    }
}

impl PlatformBackend for HostPlatform {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn query_properties(&self, props: &mut PlatformProperties) -> UrResult {
        props.name = "UniRT Host Platform".to_string();
        props.vendor = "UniRT".to_string();
        props.version = env!("CARGO_PKG_VERSION").to_string();
        props.extensions = "unirt_usm unirt_queue_batching".to_string();
        props.profile = "FULL_PROFILE".to_string();
        props.backend = AdapterBackend::NativeCpu;
        Ok(())
    }

    fn enumerate_devices(&self) -> UrResult<Vec<Arc<dyn DeviceBackend>>> {
        Ok(self
            .devices
            .iter()
            .map(|device| Arc::clone(device) as Arc<dyn DeviceBackend>)
            .collect())
    }

    fn create_context(
        &self,
        devices: &[Arc<dyn DeviceBackend>],
    ) -> UrResult<Box<dyn ContextBackend>> {
        Ok(Box::new(HostContext::new(devices.len())))
    }
}

/// 主机设备
#[derive(Debug)]
pub struct HostDevice {
    index: usize,
}

impl HostDevice {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl DeviceBackend for HostDevice {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn query_properties(&self, props: &mut DeviceProperties) -> UrResult {
        let full = UsmCapabilities::ACCESS
            | UsmCapabilities::ATOMIC_ACCESS
            | UsmCapabilities::CONCURRENT_ACCESS
            | UsmCapabilities::CONCURRENT_ATOMIC_ACCESS;

        props.device_type = DeviceType::Cpu;
        props.name = format!("UniRT Host Device {}", self.index);
        props.vendor = "UniRT".to_string();
        props.driver_version = env!("CARGO_PKG_VERSION").to_string();
        props.device_id = u32::try_from(self.index).unwrap_or(u32::MAX);
        props.max_compute_units = u32::try_from(num_cpus::get()).unwrap_or(u32::MAX);
        props.max_work_item_sizes = HOST_MAX_WORK_ITEM_SIZES.to_vec();
        props.max_work_group_size = HOST_MAX_WORK_GROUP_SIZE;
        props.global_mem_size = HOST_GLOBAL_MEM_SIZE;
        props.max_mem_alloc_size = HOST_MAX_ALLOC_SIZE;
        props.mem_base_addr_align = u32::try_from(crate::context::HOST_USM_ALIGNMENT)
            .unwrap_or(u32::MAX);
        props.host_unified_memory = true;
        props.usm_host_support = full;
        props.usm_device_support = full;
        props.usm_single_shared_support = full;
        props.usm_cross_shared_support = full;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
