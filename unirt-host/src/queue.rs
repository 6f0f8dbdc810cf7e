//! 主机队列
//!
//! 每个队列拥有一个工作线程，通过通道接收批次并按顺序执行：
//! 先等待依赖事件，依赖失败时以同一错误完成，否则执行操作并完成事件。

use crate::context::HostBuffer;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use unirt_core::{
    Command, EventBackend, Mem, NativeHandle, QueueBackend, QueueFlags, QueueProperties,
    Submission,
};
use unirt_error::{UrError, UrResult};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

enum Message {
    Batch(Vec<Submission>),
    /// 处理完此前的所有消息后应答
    Sync(Sender<()>),
}

/// 主机队列
pub struct HostQueue {
    id: u64,
    flags: QueueFlags,
    sender: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    in_flight: Arc<AtomicUsize>,
}

impl HostQueue {
    /// 创建队列并启动工作线程
    pub fn spawn(props: &QueueProperties) -> UrResult<Self> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let worker_in_flight = Arc::clone(&in_flight);

        let worker = thread::Builder::new()
            .name(format!("unirt-host-queue-{id}"))
            .spawn(move || worker_loop(receiver, worker_in_flight))
            .map_err(|e| {
                tracing::error!("Failed to spawn queue worker: {}", e);
                UrError::OutOfResources
            })?;
        let worker_id = worker.thread().id();
        tracing::debug!("Host queue {} started", id);

        Ok(Self {
            id,
            flags: props.flags,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            worker_id,
            in_flight,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    fn send(&self, message: Message) -> UrResult {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(UrError::InvalidQueue)?;
        // 发送失败时消息随错误一起被丢弃，其中的信号以 DeviceLost 完成
        sender.send(message).map_err(|_| UrError::DeviceLost)
    }

    /// 关闭通道；`join` 时等待工作线程处理完剩余消息
    fn shutdown(&self, join: bool) {
        drop(self.sender.lock().take());
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if join && thread::current().id() != self.worker_id && worker.join().is_err() {
            tracing::error!("Host queue {} worker panicked", self.id);
        }
    }
}

impl QueueBackend for HostQueue {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn create_event(&self) -> UrResult<Box<dyn EventBackend>> {
        Ok(Box::new(HostEvent::new(self.id)))
    }

    fn submit(&self, batch: Vec<Submission>) -> UrResult {
        let count = batch.len();
        self.in_flight.fetch_add(count, Ordering::AcqRel);
        self.send(Message::Batch(batch)).inspect_err(|_| {
            self.in_flight.fetch_sub(count, Ordering::AcqRel);
        })
    }

    fn finish(&self) -> UrResult {
        let (ack, done) = crossbeam_channel::bounded(1);
        self.send(Message::Sync(ack))?;
        done.recv().map_err(|_| UrError::DeviceLost)
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    fn release(&self) {
        self.shutdown(true);
        tracing::debug!("Host queue {} released", self.id);
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

fn worker_loop(receiver: Receiver<Message>, in_flight: Arc<AtomicUsize>) {
    for message in receiver.iter() {
        match message {
            Message::Batch(batch) => {
                for submission in batch {
                    execute(submission);
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }
            Message::Sync(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn execute(Submission { command, signal }: Submission) {
    if let Err(e) = signal.wait_dependencies() {
        tracing::debug!("{:?} skipped: dependency failed with {}", command.command_type(), e);
        signal.complete(Err(e));
        return;
    }
    signal.running();
    let result = run_command(&command);
    if let Err(e) = result {
        tracing::warn!("{:?} failed: {}", command.command_type(), e);
    }
    signal.complete(result);
}

fn host_buffer(buffer: &Mem) -> UrResult<&HostBuffer> {
    buffer
        .backend()
        .as_any()
        .downcast_ref::<HostBuffer>()
        .ok_or(UrError::InvalidMemObject)
}

fn run_command(command: &Command) -> UrResult {
    match command {
        Command::MemBufferWrite {
            buffer,
            offset,
            data,
        } => host_buffer(buffer)?.write(*offset, data),
        Command::MemBufferRead {
            buffer,
            offset,
            dst,
            size,
        } => {
            // SAFETY: 读操作总是阻塞入队，调用者的目标切片在事件终止前保持借用
            let out = unsafe { std::slice::from_raw_parts_mut(dst.as_mut_ptr(), *size) };
            host_buffer(buffer)?.read_into(*offset, out)
        }
        Command::UsmFill { ptr, pattern, size } => {
            // SAFETY: 入队时已确认 [ptr, ptr + size) 位于存活的 USM 分配内
            let region = unsafe { std::slice::from_raw_parts_mut(ptr.as_mut_ptr(), *size) };
            for chunk in region.chunks_exact_mut(pattern.len()) {
                chunk.copy_from_slice(pattern);
            }
            Ok(())
        }
        Command::UsmMemcpy { dst, src, size } => {
            // SAFETY: 两端区域都已确认位于存活的 USM 分配内；允许重叠
            unsafe { std::ptr::copy(src.as_mut_ptr().cast_const(), dst.as_mut_ptr(), *size) };
            Ok(())
        }
        // 队列按顺序执行，屏障之前的操作此时都已完成
        Command::EventsWait | Command::Barrier => Ok(()),
    }
}

/// 主机事件
#[derive(Debug)]
pub struct HostEvent {
    queue_id: u64,
}

impl HostEvent {
    pub fn new(queue_id: u64) -> Self {
        Self { queue_id }
    }

    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }
}

impl EventBackend for HostEvent {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }
}
