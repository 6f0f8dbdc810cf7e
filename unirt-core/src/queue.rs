//! 命令队列
//!
//! 入队的操作先缓存在队列中，缓存达到批处理大小时自动派发给后端；
//! `flush`、`finish`、阻塞入队和事件等待会提前派发。派发在持有缓存锁时进行，
//! 因此同一队列上的操作总是按提交顺序交给后端。

use bitflags::bitflags;
use crate::adapter::{NativeHandle, QueueBackend};
use crate::context::Context;
use crate::device::Device;
use crate::event::{CommandType, Event, EventSignal};
use crate::handle::{RefCount, RefCounted, release_all, retain_all};
use crate::info::ReturnHelper;
use crate::memory::Mem;
use crate::platform::non_null_handle;
use crate::usm::UsmPtr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use unirt_common::{RuntimeConfig, UrMutex};
use unirt_error::{UrError, UrResult, ur_assert};

bitflags! {
    /// 队列创建标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct QueueFlags: u32 {
        const OUT_OF_ORDER_EXEC_MODE_ENABLE = 1 << 0;
        const PROFILING_ENABLE = 1 << 1;
        const ON_DEVICE = 1 << 2;
        const ON_DEVICE_DEFAULT = 1 << 3;
        const DISCARD_EVENTS = 1 << 4;
        const PRIORITY_LOW = 1 << 5;
        const PRIORITY_HIGH = 1 << 6;
    }
}

/// 队列属性
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProperties {
    pub flags: QueueFlags,
}

/// 队列查询属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QueueInfo {
    Context = 0,
    Device = 1,
    ReferenceCount = 2,
    Flags = 3,
    /// 队列中是否没有缓存或正在执行的操作
    Empty = 4,
}

/// 交给后端执行的操作
#[derive(Debug)]
pub enum Command {
    /// 把 `data` 写入缓冲区 `offset` 处
    MemBufferWrite {
        buffer: Mem,
        offset: usize,
        data: Vec<u8>,
    },
    /// 把缓冲区内容读到调用者的主机地址 `dst`，调用者阻塞到操作终止
    MemBufferRead {
        buffer: Mem,
        offset: usize,
        dst: UsmPtr,
        size: usize,
    },
    /// 以 `pattern` 重复填充 `size` 字节
    UsmFill {
        ptr: UsmPtr,
        pattern: Vec<u8>,
        size: usize,
    },
    UsmMemcpy {
        dst: UsmPtr,
        src: UsmPtr,
        size: usize,
    },
    /// 只等待依赖
    EventsWait,
    /// 等待依赖以及此前提交的全部操作
    Barrier,
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::MemBufferWrite { .. } => CommandType::MemBufferWrite,
            Command::MemBufferRead { .. } => CommandType::MemBufferRead,
            Command::UsmFill { .. } => CommandType::UsmFill,
            Command::UsmMemcpy { .. } => CommandType::UsmMemcpy,
            Command::EventsWait => CommandType::EventsWait,
            Command::Barrier => CommandType::EventsWaitWithBarrier,
        }
    }
}

/// 一次提交：操作及其完成信号
#[derive(Debug)]
pub struct Submission {
    pub command: Command,
    pub signal: EventSignal,
}

/// 队列句柄
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

pub(crate) struct QueueInner {
    ref_count: RefCount,
    context: Context,
    device: Device,
    properties: QueueProperties,
    backend: Box<dyn QueueBackend>,
    pending: UrMutex<Vec<Submission>>,
    batch_size: usize,
}

impl Queue {
    /// 在上下文中的设备上创建队列
    pub fn create(
        context: &Context,
        device: &Device,
        props: Option<&QueueProperties>,
    ) -> UrResult<Queue> {
        context.ensure_alive()?;
        ur_assert!(context.contains_device(device), UrError::InvalidDevice);

        let properties = props.copied().unwrap_or_default();
        let flags = properties.flags;
        ur_assert!(QueueFlags::all().contains(flags), UrError::InvalidEnumeration);
        ur_assert!(
            !flags.contains(QueueFlags::PRIORITY_LOW | QueueFlags::PRIORITY_HIGH),
            UrError::InvalidValue
        );
        ur_assert!(
            !flags.intersects(QueueFlags::ON_DEVICE | QueueFlags::ON_DEVICE_DEFAULT),
            UrError::UnsupportedFeature
        );

        let backend = context.backend().create_queue(device.backend(), &properties)?;
        context.retain()?;
        let batch_size = RuntimeConfig::global().queue_batch_size;
        tracing::debug!("Created queue with batch size {}", batch_size);

        Ok(Self(Arc::new(QueueInner {
            ref_count: RefCount::new(),
            context: context.clone(),
            device: device.clone(),
            properties,
            backend,
            pending: UrMutex::new(Vec::with_capacity(batch_size)),
            batch_size,
        })))
    }

    pub(crate) fn from_inner(inner: Arc<QueueInner>) -> Self {
        Self(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<QueueInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn backend(&self) -> &dyn QueueBackend {
        self.0.backend.as_ref()
    }

    pub fn context(&self) -> &Context {
        &self.0.context
    }

    pub fn device(&self) -> &Device {
        &self.0.device
    }

    pub fn properties(&self) -> &QueueProperties {
        &self.0.properties
    }

    /// 当前缓存、尚未派发的操作数
    pub fn pending_count(&self) -> usize {
        self.0.pending.lock().len()
    }

    /// 队列中是否没有缓存或正在执行的操作
    pub fn is_empty(&self) -> bool {
        self.0.pending.lock().is_empty() && self.0.backend.is_idle()
    }

    /// 把缓存的操作交给后端，不等待完成
    pub fn flush(&self) -> UrResult {
        self.ensure_alive()?;
        self.dispatch_pending()
    }

    /// 派发并阻塞到此前提交的全部操作完成
    pub fn finish(&self) -> UrResult {
        self.ensure_alive()?;
        self.dispatch_pending()?;
        self.0.backend.finish()
    }

    pub(crate) fn dispatch_pending(&self) -> UrResult {
        let mut pending = self.0.pending.lock();
        self.dispatch_locked(&mut pending)
    }

    fn dispatch_locked(&self, pending: &mut Vec<Submission>) -> UrResult {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(pending, Vec::with_capacity(self.0.batch_size));
        for submission in &batch {
            submission.signal.submitted();
        }
        tracing::trace!("Dispatching {} operations", batch.len());
        self.0.backend.submit(batch)
    }

    /// 缓存一个操作并返回其事件（调用者持有一次引用）
    fn enqueue(&self, command: Command, wait_list: &[Event], keep_alive: Vec<Mem>) -> UrResult<Event> {
        for event in wait_list {
            event.ensure_alive()?;
            ur_assert!(
                event.context().same_as(&self.0.context),
                UrError::InvalidEventWaitList
            );
        }

        // 其他队列缓存的依赖必须先派发，否则后端会一直等待
        for event in wait_list {
            if let Some(queue) = event.queue() {
                if !queue.same_as(self) {
                    queue.dispatch_pending()?;
                }
            }
        }

        let event = Event::new(self, command.command_type())?;
        if let Err(e) = retain_for_submission(&event, wait_list, &keep_alive) {
            let _ = event.release();
            return Err(e);
        }
        let signal = EventSignal::new(event.clone(), wait_list.to_vec(), keep_alive);

        let mut pending = self.0.pending.lock();
        pending.push(Submission { command, signal });
        if pending.len() >= self.0.batch_size {
            if let Err(e) = self.dispatch_locked(&mut pending) {
                let _ = event.release();
                return Err(e);
            }
        }
        Ok(event)
    }

    /// 派发并等待单个事件；即使派发失败也要等到事件终止
    fn block_on(&self, event: &Event) -> UrResult {
        let dispatched = self.dispatch_pending();
        let waited = event.wait_terminal();
        dispatched.and(waited)
    }

    fn finish_blocking(&self, event: Event) -> UrResult<Event> {
        match self.block_on(&event) {
            Ok(()) => Ok(event),
            Err(e) => {
                let _ = event.release();
                Err(e)
            }
        }
    }

    /// 写缓冲区
    pub fn enqueue_mem_buffer_write(
        &self,
        buffer: &Mem,
        blocking: bool,
        offset: usize,
        data: &[u8],
        wait_list: &[Event],
    ) -> UrResult<Event> {
        self.ensure_alive()?;
        buffer.ensure_alive()?;
        ur_assert!(buffer.context().same_as(&self.0.context), UrError::InvalidContext);
        buffer.check_range(offset, data.len())?;

        let command = Command::MemBufferWrite {
            buffer: buffer.clone(),
            offset,
            data: data.to_vec(),
        };
        let event = self.enqueue(command, wait_list, vec![buffer.clone()])?;
        if blocking {
            self.finish_blocking(event)
        } else {
            Ok(event)
        }
    }

    /// 读缓冲区，总是阻塞到数据写入 `dst`
    pub fn enqueue_mem_buffer_read(
        &self,
        buffer: &Mem,
        offset: usize,
        dst: &mut [u8],
        wait_list: &[Event],
    ) -> UrResult<Event> {
        self.ensure_alive()?;
        buffer.ensure_alive()?;
        ur_assert!(buffer.context().same_as(&self.0.context), UrError::InvalidContext);
        buffer.check_range(offset, dst.len())?;

        let command = Command::MemBufferRead {
            buffer: buffer.clone(),
            offset,
            dst: UsmPtr::from_ptr(dst.as_mut_ptr()),
            size: dst.len(),
        };
        let event = self.enqueue(command, wait_list, vec![buffer.clone()])?;
        self.finish_blocking(event)
    }

    /// 以模式填充 USM 区域
    ///
    /// 模式长度必须是 2 的幂，`size` 必须是模式长度的整数倍，
    /// 且整个区域位于此上下文的某个分配内。
    pub fn enqueue_usm_fill(
        &self,
        ptr: UsmPtr,
        pattern: &[u8],
        size: usize,
        wait_list: &[Event],
    ) -> UrResult<Event> {
        self.ensure_alive()?;
        ur_assert!(!ptr.is_null(), UrError::InvalidNullPointer);
        ur_assert!(!pattern.is_empty(), UrError::InvalidSize);
        ur_assert!(pattern.len().is_power_of_two(), UrError::InvalidValue);
        ur_assert!(size != 0, UrError::InvalidSize);
        ur_assert!(size % pattern.len() == 0, UrError::InvalidSize);
        self.0.context.check_usm_range(ptr, size)?;

        let command = Command::UsmFill {
            ptr,
            pattern: pattern.to_vec(),
            size,
        };
        self.enqueue(command, wait_list, Vec::new())
    }

    /// USM 之间的拷贝，两端都必须位于此上下文的分配内
    pub fn enqueue_usm_memcpy(
        &self,
        blocking: bool,
        dst: UsmPtr,
        src: UsmPtr,
        size: usize,
        wait_list: &[Event],
    ) -> UrResult<Event> {
        self.ensure_alive()?;
        ur_assert!(!dst.is_null() && !src.is_null(), UrError::InvalidNullPointer);
        ur_assert!(size != 0, UrError::InvalidSize);
        self.0.context.check_usm_range(dst, size)?;
        self.0.context.check_usm_range(src, size)?;

        let event = self.enqueue(Command::UsmMemcpy { dst, src, size }, wait_list, Vec::new())?;
        if blocking {
            self.finish_blocking(event)
        } else {
            Ok(event)
        }
    }

    /// 等待依赖事件的标记操作
    pub fn enqueue_events_wait(&self, wait_list: &[Event]) -> UrResult<Event> {
        self.ensure_alive()?;
        self.enqueue(Command::EventsWait, wait_list, Vec::new())
    }

    /// 屏障：等待依赖以及此前提交的全部操作
    pub fn enqueue_events_wait_with_barrier(&self, wait_list: &[Event]) -> UrResult<Event> {
        self.ensure_alive()?;
        self.enqueue(Command::Barrier, wait_list, Vec::new())
    }

    pub fn native_handle(&self) -> UrResult<NativeHandle> {
        self.ensure_alive()?;
        non_null_handle(self.0.backend.native_handle())
    }

    /// 两阶段属性查询
    pub fn get_info(&self, prop: QueueInfo, ret: ReturnHelper<'_>) -> UrResult {
        self.ensure_alive()?;
        match prop {
            QueueInfo::Context => ret.scalar(self.0.context.handle_id()),
            QueueInfo::Device => ret.scalar(self.0.device.handle_id()),
            QueueInfo::ReferenceCount => ret.scalar(self.reference_count()),
            QueueInfo::Flags => ret.scalar(self.0.properties.flags),
            QueueInfo::Empty => ret.scalar(self.is_empty()),
        }
    }

    pub fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn same_as(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// 为一次提交增加内部引用：事件本身、依赖事件和操作引用的缓冲区
fn retain_for_submission(event: &Event, wait_list: &[Event], keep_alive: &[Mem]) -> UrResult {
    event.retain()?;
    if let Err(e) = retain_all(wait_list) {
        let _ = event.release();
        return Err(e);
    }
    if let Err(e) = retain_all(keep_alive) {
        release_all(wait_list);
        let _ = event.release();
        return Err(e);
    }
    Ok(())
}

impl RefCounted for Queue {
    const INVALID_HANDLE: UrError = UrError::InvalidQueue;

    fn ref_count(&self) -> &RefCount {
        &self.0.ref_count
    }

    fn on_destroy(&self) {
        if let Err(e) = self.dispatch_pending() {
            tracing::warn!("Dispatching pending work of a released queue failed: {}", e);
        }
        self.0.backend.release();
        if let Err(e) = self.0.context.release() {
            tracing::warn!("Queue released its context twice: {}", e);
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &format_args!("{:#x}", self.handle_id()))
            .field("flags", &self.0.properties.flags)
            .field("batch_size", &self.0.batch_size)
            .finish()
    }
}
