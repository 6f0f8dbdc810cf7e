//! 事件
//!
//! 每个入队操作对应一个事件，状态只会单调前进：
//! `Queued -> Submitted -> Running -> Complete | Error`。
//! 操作执行期间，事件本身、其依赖事件以及操作引用的缓冲区都被
//! `EventSignal` 持有一次内部引用，操作终止时统一释放。

use crate::adapter::{EventBackend, NativeHandle};
use crate::context::Context;
use crate::handle::{RefCount, RefCounted, release_all};
use crate::info::{InfoScalar, ReturnHelper};
use crate::memory::Mem;
use crate::platform::non_null_handle;
use crate::queue::{Queue, QueueInner};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, Weak};
use unirt_error::{UrError, UrResult};

/// 事件执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    Error(UrError),
}

impl EventStatus {
    fn rank(self) -> u8 {
        match self {
            EventStatus::Queued => 0,
            EventStatus::Submitted => 1,
            EventStatus::Running => 2,
            EventStatus::Complete | EventStatus::Error(_) => 3,
        }
    }

    /// 是否为终止状态
    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// 终止状态对应的结果
    pub fn result(self) -> Option<UrResult> {
        match self {
            EventStatus::Complete => Some(Ok(())),
            EventStatus::Error(e) => Some(Err(e)),
            _ => None,
        }
    }

    /// C 接口的执行状态码：完成为 0，失败为负的错误码
    pub fn execution_status(self) -> i32 {
        match self {
            EventStatus::Complete => 0,
            EventStatus::Running => 1,
            EventStatus::Submitted => 2,
            EventStatus::Queued => 3,
            EventStatus::Error(e) => i32::try_from(e.code()).map_or(i32::MIN, |code| -code),
        }
    }
}

/// 产生事件的操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    MemBufferRead = 1,
    MemBufferWrite = 2,
    EventsWait = 3,
    EventsWaitWithBarrier = 4,
    UsmFill = 5,
    UsmMemcpy = 6,
}

impl InfoScalar for CommandType {
    const SIZE: usize = std::mem::size_of::<u32>();

    fn write_ne(self, out: &mut [u8]) {
        (self as u32).write_ne(out);
    }
}

/// 事件查询属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventInfo {
    CommandQueue = 0,
    Context = 1,
    CommandType = 2,
    CommandExecutionStatus = 3,
    ReferenceCount = 4,
}

/// 事件句柄
#[derive(Clone)]
pub struct Event(Arc<EventInner>);

struct EventInner {
    ref_count: RefCount,
    context: Context,
    queue: Weak<QueueInner>,
    queue_id: usize,
    command_type: CommandType,
    status: Mutex<EventStatus>,
    terminated: Condvar,
    backend: Box<dyn EventBackend>,
}

impl Event {
    pub(crate) fn new(queue: &Queue, command_type: CommandType) -> UrResult<Event> {
        let backend = queue.backend().create_event()?;
        queue.context().retain()?;
        Ok(Self(Arc::new(EventInner {
            ref_count: RefCount::new(),
            context: queue.context().clone(),
            queue: queue.downgrade(),
            queue_id: queue.handle_id(),
            command_type,
            status: Mutex::new(EventStatus::Queued),
            terminated: Condvar::new(),
            backend,
        })))
    }

    pub fn status(&self) -> EventStatus {
        *self.0.status.lock()
    }

    pub fn command_type(&self) -> CommandType {
        self.0.command_type
    }

    pub fn context(&self) -> &Context {
        &self.0.context
    }

    /// 产生此事件的队列（已被回收时为 `None`）
    pub fn queue(&self) -> Option<Queue> {
        self.0.queue.upgrade().map(Queue::from_inner)
    }

    /// 推进状态；不会后退，终止后不再改变
    pub(crate) fn advance(&self, next: EventStatus) -> bool {
        let mut status = self.0.status.lock();
        if next.rank() <= status.rank() {
            return false;
        }
        *status = next;
        if next.is_terminal() {
            self.0.terminated.notify_all();
        }
        true
    }

    /// 阻塞到此事件终止，返回其结果
    pub fn wait_terminal(&self) -> UrResult {
        let mut status = self.0.status.lock();
        loop {
            if let Some(result) = status.result() {
                return result;
            }
            self.0.terminated.wait(&mut status);
        }
    }

    /// 等待一组事件全部终止
    ///
    /// 先派发这些事件所在队列中缓存的操作，再逐个等待；
    /// 返回列表中第一个失败事件的错误。
    pub fn wait(events: &[Event]) -> UrResult {
        for event in events {
            event.ensure_alive()?;
        }

        let mut flushed: Vec<usize> = Vec::new();
        for event in events {
            if flushed.contains(&event.0.queue_id) {
                continue;
            }
            flushed.push(event.0.queue_id);
            if let Some(queue) = event.queue() {
                queue.dispatch_pending()?;
            }
        }

        let mut first_error = None;
        for event in events {
            if let Err(e) = event.wait_terminal() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn native_handle(&self) -> UrResult<NativeHandle> {
        self.ensure_alive()?;
        non_null_handle(self.0.backend.native_handle())
    }

    /// 两阶段属性查询
    pub fn get_info(&self, prop: EventInfo, ret: ReturnHelper<'_>) -> UrResult {
        self.ensure_alive()?;
        match prop {
            EventInfo::CommandQueue => ret.scalar(self.0.queue_id),
            EventInfo::Context => ret.scalar(self.0.context.handle_id()),
            EventInfo::CommandType => ret.scalar(self.0.command_type),
            EventInfo::CommandExecutionStatus => ret.scalar(self.status().execution_status()),
            EventInfo::ReferenceCount => ret.scalar(self.reference_count()),
        }
    }

    pub fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn same_as(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl RefCounted for Event {
    const INVALID_HANDLE: UrError = UrError::InvalidEvent;

    fn ref_count(&self) -> &RefCount {
        &self.0.ref_count
    }

    fn on_destroy(&self) {
        self.0.backend.release();
        if let Err(e) = self.0.context.release() {
            tracing::warn!("Event released its context twice: {}", e);
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &format_args!("{:#x}", self.handle_id()))
            .field("command", &self.0.command_type)
            .field("status", &self.status())
            .finish()
    }
}

/// 入队操作的完成信号
///
/// 后端执行操作时使用：先 `wait_dependencies`，再 `running`，
/// 最后以执行结果调用 `complete`。未完成就被丢弃的信号以 `DeviceLost` 完成，
/// 因此等待者永远不会被遗留。
pub struct EventSignal {
    event: Event,
    wait_list: Vec<Event>,
    keep_alive: Vec<Mem>,
    completed: bool,
}

impl EventSignal {
    /// 所有传入的句柄都已经由调用者增加了内部引用
    pub(crate) fn new(event: Event, wait_list: Vec<Event>, keep_alive: Vec<Mem>) -> Self {
        Self {
            event,
            wait_list,
            keep_alive,
            completed: false,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn wait_list(&self) -> &[Event] {
        &self.wait_list
    }

    /// 阻塞到所有依赖终止，返回第一个失败依赖的错误
    pub fn wait_dependencies(&self) -> UrResult {
        let mut first_error = None;
        for event in &self.wait_list {
            if let Err(e) = event.wait_terminal() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn submitted(&self) {
        self.event.advance(EventStatus::Submitted);
    }

    /// 标记操作开始执行
    pub fn running(&self) {
        self.event.advance(EventStatus::Running);
    }

    /// 以执行结果终止事件并释放内部引用
    pub fn complete(mut self, result: UrResult) {
        self.finish(result);
    }

    fn finish(&mut self, result: UrResult) {
        if self.completed {
            return;
        }
        self.completed = true;

        let status = match result {
            Ok(()) => EventStatus::Complete,
            Err(e) => EventStatus::Error(e),
        };
        // 先归还内部引用，等待者醒来时引用计数已经稳定
        release_all(&self.keep_alive);
        release_all(&self.wait_list);
        release_all(std::slice::from_ref(&self.event));
        self.event.advance(status);
    }
}

impl Drop for EventSignal {
    fn drop(&mut self) {
        if !self.completed {
            tracing::warn!(
                "{:?} dropped before completion, marking device lost",
                self.event.command_type()
            );
            self.finish(Err(UrError::DeviceLost));
        }
    }
}

impl fmt::Debug for EventSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSignal")
            .field("event", &self.event)
            .field("wait_list", &self.wait_list.len())
            .finish()
    }
}
