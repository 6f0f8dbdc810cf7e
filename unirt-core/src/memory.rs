//! 缓冲区内存对象

use bitflags::bitflags;
use crate::adapter::{MemBackend, NativeHandle};
use crate::context::Context;
use crate::handle::{RefCount, RefCounted};
use crate::platform::non_null_handle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use unirt_error::{UrError, UrResult, ur_assert};

bitflags! {
    /// 缓冲区创建标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MemFlags: u32 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_POINTER = 1 << 3;
        const ALLOC_HOST_POINTER = 1 << 4;
        const ALLOC_COPY_HOST_POINTER = 1 << 5;
    }
}

impl MemFlags {
    const ACCESS: Self = Self::from_bits_retain(
        Self::READ_WRITE.bits() | Self::WRITE_ONLY.bits() | Self::READ_ONLY.bits(),
    );
    const NEEDS_HOST_DATA: Self = Self::from_bits_retain(
        Self::USE_HOST_POINTER.bits() | Self::ALLOC_COPY_HOST_POINTER.bits(),
    );
}

/// 缓冲区句柄
#[derive(Clone)]
pub struct Mem(Arc<MemInner>);

struct MemInner {
    ref_count: RefCount,
    context: Context,
    flags: MemFlags,
    size: usize,
    backend: Arc<dyn MemBackend>,
}

impl Mem {
    /// 创建缓冲区
    ///
    /// `USE_HOST_POINTER` 和 `ALLOC_COPY_HOST_POINTER` 需要提供至少 `size`
    /// 字节的初始数据，其他情况下不能提供初始数据。
    pub fn buffer_create(
        context: &Context,
        flags: MemFlags,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> UrResult<Mem> {
        context.ensure_alive()?;
        ur_assert!(MemFlags::all().contains(flags), UrError::InvalidEnumeration);
        ur_assert!(
            (flags & MemFlags::ACCESS).bits().count_ones() <= 1,
            UrError::InvalidValue
        );
        ur_assert!(size != 0, UrError::InvalidBufferSize);

        let mut limit = 0;
        for device in context.devices() {
            limit = limit.max(device.max_mem_alloc_size()?);
        }
        ur_assert!(size as u64 <= limit, UrError::InvalidBufferSize);

        match host_data {
            Some(data) => {
                ur_assert!(flags.intersects(MemFlags::NEEDS_HOST_DATA), UrError::InvalidValue);
                ur_assert!(data.len() >= size, UrError::InvalidValue);
            }
            None => ur_assert!(
                !flags.intersects(MemFlags::NEEDS_HOST_DATA),
                UrError::InvalidValue
            ),
        }

        let backend = context
            .backend()
            .create_buffer(flags, size, host_data.map(|d| &d[..size]))?;
        context.retain()?;
        Ok(Self(Arc::new(MemInner {
            ref_count: RefCount::new(),
            context: context.clone(),
            flags,
            size,
            backend,
        })))
    }

    pub fn context(&self) -> &Context {
        &self.0.context
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn flags(&self) -> MemFlags {
        self.0.flags
    }

    /// 后端内存对象，供后端在执行命令时向下转换
    pub fn backend(&self) -> &Arc<dyn MemBackend> {
        &self.0.backend
    }

    pub fn native_handle(&self) -> UrResult<NativeHandle> {
        self.ensure_alive()?;
        non_null_handle(self.0.backend.native_handle())
    }

    /// 校验 `[offset, offset + len)` 位于缓冲区内
    pub(crate) fn check_range(&self, offset: usize, len: usize) -> UrResult {
        ur_assert!(len != 0, UrError::InvalidSize);
        let end = offset.checked_add(len).ok_or(UrError::InvalidSize)?;
        ur_assert!(end <= self.0.size, UrError::InvalidSize);
        Ok(())
    }

    pub fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl RefCounted for Mem {
    const INVALID_HANDLE: UrError = UrError::InvalidMemObject;

    fn ref_count(&self) -> &RefCount {
        &self.0.ref_count
    }

    fn on_destroy(&self) {
        self.0.backend.release();
        if let Err(e) = self.0.context.release() {
            tracing::warn!("Buffer released its context twice: {}", e);
        }
    }
}

impl fmt::Debug for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mem")
            .field("id", &format_args!("{:#x}", self.handle_id()))
            .field("size", &self.0.size)
            .field("flags", &self.0.flags)
            .finish()
    }
}
