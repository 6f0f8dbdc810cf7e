//! 主机上下文与缓冲区
//!
//! USM 分配直接来自进程堆并清零；主机、设备和共享分配在主机上
//! 是同一种内存，放置方式只影响核心层的记录。

use crate::queue::HostQueue;
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use unirt_core::{
    ContextBackend, DeviceBackend, MemBackend, MemFlags, NativeHandle, QueueBackend,
    QueueProperties, UsmAllocRequest, UsmPtr,
};
use unirt_error::{UrError, UrResult, ur_assert};

/// 未指定对齐时的 USM 对齐（缓存行）
pub const HOST_USM_ALIGNMENT: usize = 64;

/// 主机上下文
#[derive(Debug)]
pub struct HostContext {
    device_count: usize,
    allocations: Mutex<HashMap<usize, Layout>>,
}

impl HostContext {
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// 存活的分配数量
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }
}

impl ContextBackend for HostContext {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn usm_alloc(&self, request: &UsmAllocRequest<'_>) -> UrResult<UsmPtr> {
        let align = request.align.max(HOST_USM_ALIGNMENT);
        let layout =
            Layout::from_size_align(request.size, align).map_err(|_| UrError::InvalidUsmSize)?;
        ur_assert!(layout.size() != 0, UrError::InvalidUsmSize);

        // 主机内存对所有建议都一致可见，建议整体记录在核心层
        // SAFETY: layout 大小非零
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(UrError::OutOfHostMemory);
        }
        self.allocations.lock().insert(ptr as usize, layout);
        tracing::trace!(
            "Host {:?} allocation {:p} ({} bytes, align {})",
            request.placement,
            ptr,
            request.size,
            align
        );
        Ok(UsmPtr::from_ptr(ptr))
    }

    fn usm_free(&self, ptr: UsmPtr) -> UrResult {
        let layout = self
            .allocations
            .lock()
            .remove(&ptr.addr())
            .ok_or(UrError::InvalidMemObject)?;
        // SAFETY: ptr 由 alloc_zeroed 以同一 layout 分配，且只释放一次
        unsafe { alloc::dealloc(ptr.as_mut_ptr(), layout) };
        Ok(())
    }

    fn create_buffer(
        &self,
        _flags: MemFlags,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> UrResult<Arc<dyn MemBackend>> {
        Ok(Arc::new(HostBuffer::new(size, host_data)))
    }

    fn create_queue(
        &self,
        _device: &Arc<dyn DeviceBackend>,
        props: &QueueProperties,
    ) -> UrResult<Box<dyn QueueBackend>> {
        Ok(Box::new(HostQueue::spawn(props)?))
    }

    fn release(&self) {
        let leaked = self.allocations.lock().len();
        if leaked > 0 {
            tracing::warn!("Host context released with {} live allocations", leaked);
        }
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        for (addr, layout) in self.allocations.get_mut().drain() {
            // SAFETY: 记录中的每个地址都以对应 layout 分配且尚未释放
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

/// 主机缓冲区
///
/// 内容由队列工作线程读写，因此使用真实的互斥锁，不受单线程模式影响。
#[derive(Debug)]
pub struct HostBuffer {
    data: Mutex<Vec<u8>>,
}

impl HostBuffer {
    pub fn new(size: usize, host_data: Option<&[u8]>) -> Self {
        let data = match host_data {
            Some(initial) => initial[..size].to_vec(),
            None => vec![0; size],
        };
        Self {
            data: Mutex::new(data),
        }
    }

    /// 写入 `bytes` 到 `offset` 处
    pub fn write(&self, offset: usize, bytes: &[u8]) -> UrResult {
        let mut data = self.data.lock();
        let end = offset.checked_add(bytes.len()).ok_or(UrError::InvalidSize)?;
        let target = data.get_mut(offset..end).ok_or(UrError::InvalidSize)?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// 读取 `offset` 处的内容到 `out`
    pub fn read_into(&self, offset: usize, out: &mut [u8]) -> UrResult {
        let data = self.data.lock();
        let end = offset.checked_add(out.len()).ok_or(UrError::InvalidSize)?;
        let source = data.get(offset..end).ok_or(UrError::InvalidSize)?;
        out.copy_from_slice(source);
        Ok(())
    }

    /// 当前内容的拷贝
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl MemBackend for HostBuffer {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
