//! 入口点
//!
//! 与 C 接口一一对应的函数：句柄参数是 `Option<&T>`，输出参数是
//! `Option<&mut T>`，缺失的句柄返回 `InvalidNullHandle`，缺失的输出返回
//! `InvalidNullPointer`。参数校验先于任何状态修改，校验失败不会留下副作用。
//! 开启 `print_trace` 时每次调用及其结果码都会被记录。

use crate::adapter::NativeHandle;
use crate::context::{Context, ContextInfo};
use crate::device::{Device, DeviceInfo, DeviceType};
use crate::event::{Event, EventInfo};
use crate::handle::RefCounted;
use crate::info::ReturnHelper;
use crate::memory::{Mem, MemFlags};
use crate::platform::{Platform, PlatformInfo};
use crate::queue::{Queue, QueueInfo, QueueProperties};
use crate::registry::PlatformRegistry;
use crate::usm::{UsmAllocInfo, UsmDesc, UsmPtr, UsmType};
use std::fmt::Debug;
use unirt_common::{UrCast, trace_call};
use unirt_error::{UrError, UrResult, last_error, ur_assert};

fn traced<T: Debug>(entry: &str, body: impl FnOnce() -> UrResult<T>) -> UrResult<T> {
    let result = body();
    trace_call(entry, &result);
    result
}

fn handle<T>(handle: Option<T>) -> UrResult<T> {
    handle.ok_or(UrError::InvalidNullHandle)
}

fn out<T>(output: Option<T>) -> UrResult<T> {
    output.ok_or(UrError::InvalidNullPointer)
}

/// 构造查询辅助；值缓冲区和大小输出至少要有一个
fn info_helper<'a>(
    prop_size: usize,
    prop_value: Option<&'a mut [u8]>,
    prop_size_ret: Option<&'a mut usize>,
) -> UrResult<ReturnHelper<'a>> {
    ur_assert!(
        prop_value.is_some() || prop_size_ret.is_some(),
        UrError::InvalidNullPointer
    );
    Ok(ReturnHelper::new(prop_size, prop_value, prop_size_ret))
}

/// 把新事件交给调用者；调用者不需要时立即放弃外部引用
fn hand_out(event: Event, out_event: Option<&mut Option<Event>>) -> UrResult {
    match out_event {
        Some(slot) => {
            *slot = Some(event);
            Ok(())
        }
        None => event.release(),
    }
}

/// 把枚举结果写入调用者的数组，并返回总数
fn fill_entries<T: Clone>(
    num_entries: u32,
    entries: Option<&mut [Option<T>]>,
    count: Option<&mut u32>,
    available: &[T],
) -> UrResult {
    ur_assert!(entries.is_some() || count.is_some(), UrError::InvalidNullPointer);
    if let Some(entries) = entries {
        ur_assert!(num_entries != 0, UrError::InvalidSize);
        let limit: usize = num_entries.ur_cast();
        for (slot, item) in entries.iter_mut().zip(available).take(limit) {
            *slot = Some(item.clone());
        }
    }
    if let Some(count) = count {
        *count = u32::try_from(available.len()).map_err(|_| UrError::OutOfResources)?;
    }
    Ok(())
}

// ============================================================================
// 平台与设备
// ============================================================================

/// 枚举所有平台；第一次调用时构建平台缓存
pub fn platform_get(
    num_entries: u32,
    platforms: Option<&mut [Option<Platform>]>,
    num_platforms: Option<&mut u32>,
) -> UrResult {
    traced("urPlatformGet", move || {
        let available = PlatformRegistry::global().platforms()?;
        fill_entries(num_entries, platforms, num_platforms, &available)
    })
}

pub fn platform_get_info(
    platform: Option<&Platform>,
    prop: PlatformInfo,
    prop_size: usize,
    prop_value: Option<&mut [u8]>,
    prop_size_ret: Option<&mut usize>,
) -> UrResult {
    traced("urPlatformGetInfo", move || {
        let platform = handle(platform)?;
        platform.get_info(prop, info_helper(prop_size, prop_value, prop_size_ret)?)
    })
}

pub fn platform_get_native_handle(
    platform: Option<&Platform>,
    native: Option<&mut NativeHandle>,
) -> UrResult {
    traced("urPlatformGetNativeHandle", move || {
        let platform = handle(platform)?;
        let native = out(native)?;
        *native = platform.native_handle()?;
        Ok(())
    })
}

/// 读取当前线程最近一次适配器自定义错误；没有记录时返回空消息和 0
pub fn platform_get_last_error(
    platform: Option<&Platform>,
    message: Option<&mut String>,
    error: Option<&mut i32>,
) -> UrResult {
    traced("urPlatformGetLastError", move || {
        handle(platform)?;
        let message = out(message)?;
        let error = out(error)?;
        let last = last_error().unwrap_or_default();
        *message = last.message;
        *error = last.code;
        Ok(())
    })
}

pub fn device_get(
    platform: Option<&Platform>,
    device_type: DeviceType,
    num_entries: u32,
    devices: Option<&mut [Option<Device>]>,
    num_devices: Option<&mut u32>,
) -> UrResult {
    traced("urDeviceGet", move || {
        let platform = handle(platform)?;
        let available = platform.devices_of_type(device_type)?;
        fill_entries(num_entries, devices, num_devices, &available)
    })
}

pub fn device_get_info(
    device: Option<&Device>,
    prop: DeviceInfo,
    prop_size: usize,
    prop_value: Option<&mut [u8]>,
    prop_size_ret: Option<&mut usize>,
) -> UrResult {
    traced("urDeviceGetInfo", move || {
        let device = handle(device)?;
        device.get_info(prop, info_helper(prop_size, prop_value, prop_size_ret)?)
    })
}

pub fn device_get_native_handle(
    device: Option<&Device>,
    native: Option<&mut NativeHandle>,
) -> UrResult {
    traced("urDeviceGetNativeHandle", move || {
        let device = handle(device)?;
        let native = out(native)?;
        *native = device.native_handle()?;
        Ok(())
    })
}

// ============================================================================
// 上下文
// ============================================================================

pub fn context_create(devices: Option<&[Device]>, context: Option<&mut Option<Context>>) -> UrResult {
    traced("urContextCreate", move || {
        let devices = out(devices)?;
        let context = out(context)?;
        *context = Some(Context::create(devices)?);
        Ok(())
    })
}

pub fn context_retain(context: Option<&Context>) -> UrResult {
    traced("urContextRetain", move || handle(context)?.retain())
}

pub fn context_release(context: Option<&Context>) -> UrResult {
    traced("urContextRelease", move || handle(context)?.release())
}

pub fn context_get_info(
    context: Option<&Context>,
    prop: ContextInfo,
    prop_size: usize,
    prop_value: Option<&mut [u8]>,
    prop_size_ret: Option<&mut usize>,
) -> UrResult {
    traced("urContextGetInfo", move || {
        let context = handle(context)?;
        context.get_info(prop, info_helper(prop_size, prop_value, prop_size_ret)?)
    })
}

pub fn context_get_native_handle(
    context: Option<&Context>,
    native: Option<&mut NativeHandle>,
) -> UrResult {
    traced("urContextGetNativeHandle", move || {
        let context = handle(context)?;
        let native = out(native)?;
        *native = context.native_handle()?;
        Ok(())
    })
}

// ============================================================================
// 队列
// ============================================================================

pub fn queue_create(
    context: Option<&Context>,
    device: Option<&Device>,
    props: Option<&QueueProperties>,
    queue: Option<&mut Option<Queue>>,
) -> UrResult {
    traced("urQueueCreate", move || {
        let context = handle(context)?;
        let device = handle(device)?;
        let queue = out(queue)?;
        *queue = Some(Queue::create(context, device, props)?);
        Ok(())
    })
}

pub fn queue_retain(queue: Option<&Queue>) -> UrResult {
    traced("urQueueRetain", move || handle(queue)?.retain())
}

pub fn queue_release(queue: Option<&Queue>) -> UrResult {
    traced("urQueueRelease", move || handle(queue)?.release())
}

pub fn queue_get_info(
    queue: Option<&Queue>,
    prop: QueueInfo,
    prop_size: usize,
    prop_value: Option<&mut [u8]>,
    prop_size_ret: Option<&mut usize>,
) -> UrResult {
    traced("urQueueGetInfo", move || {
        let queue = handle(queue)?;
        queue.get_info(prop, info_helper(prop_size, prop_value, prop_size_ret)?)
    })
}

pub fn queue_get_native_handle(queue: Option<&Queue>, native: Option<&mut NativeHandle>) -> UrResult {
    traced("urQueueGetNativeHandle", move || {
        let queue = handle(queue)?;
        let native = out(native)?;
        *native = queue.native_handle()?;
        Ok(())
    })
}

/// 把缓存的操作交给后端，不等待完成
pub fn queue_flush(queue: Option<&Queue>) -> UrResult {
    traced("urQueueFlush", move || handle(queue)?.flush())
}

/// 阻塞到队列中所有操作完成
pub fn queue_finish(queue: Option<&Queue>) -> UrResult {
    traced("urQueueFinish", move || handle(queue)?.finish())
}

// ============================================================================
// 事件
// ============================================================================

/// 等待一组事件全部终止；返回第一个失败事件的错误
pub fn event_wait(events: Option<&[Event]>) -> UrResult {
    traced("urEventWait", move || {
        let events = out(events)?;
        ur_assert!(!events.is_empty(), UrError::InvalidValue);
        Event::wait(events)
    })
}

pub fn event_retain(event: Option<&Event>) -> UrResult {
    traced("urEventRetain", move || handle(event)?.retain())
}

pub fn event_release(event: Option<&Event>) -> UrResult {
    traced("urEventRelease", move || handle(event)?.release())
}

pub fn event_get_info(
    event: Option<&Event>,
    prop: EventInfo,
    prop_size: usize,
    prop_value: Option<&mut [u8]>,
    prop_size_ret: Option<&mut usize>,
) -> UrResult {
    traced("urEventGetInfo", move || {
        let event = handle(event)?;
        event.get_info(prop, info_helper(prop_size, prop_value, prop_size_ret)?)
    })
}

pub fn event_get_native_handle(event: Option<&Event>, native: Option<&mut NativeHandle>) -> UrResult {
    traced("urEventGetNativeHandle", move || {
        let event = handle(event)?;
        let native = out(native)?;
        *native = event.native_handle()?;
        Ok(())
    })
}

// ============================================================================
// 缓冲区
// ============================================================================

pub fn mem_buffer_create(
    context: Option<&Context>,
    flags: MemFlags,
    size: usize,
    host_data: Option<&[u8]>,
    buffer: Option<&mut Option<Mem>>,
) -> UrResult {
    traced("urMemBufferCreate", move || {
        let context = handle(context)?;
        let buffer = out(buffer)?;
        *buffer = Some(Mem::buffer_create(context, flags, size, host_data)?);
        Ok(())
    })
}

pub fn mem_retain(buffer: Option<&Mem>) -> UrResult {
    traced("urMemRetain", move || handle(buffer)?.retain())
}

pub fn mem_release(buffer: Option<&Mem>) -> UrResult {
    traced("urMemRelease", move || handle(buffer)?.release())
}

pub fn mem_get_native_handle(buffer: Option<&Mem>, native: Option<&mut NativeHandle>) -> UrResult {
    traced("urMemGetNativeHandle", move || {
        let buffer = handle(buffer)?;
        let native = out(native)?;
        *native = buffer.native_handle()?;
        Ok(())
    })
}

// ============================================================================
// 入队操作
// ============================================================================

pub fn enqueue_mem_buffer_write(
    queue: Option<&Queue>,
    buffer: Option<&Mem>,
    blocking: bool,
    offset: usize,
    data: Option<&[u8]>,
    wait_list: &[Event],
    out_event: Option<&mut Option<Event>>,
) -> UrResult {
    traced("urEnqueueMemBufferWrite", move || {
        let queue = handle(queue)?;
        let buffer = handle(buffer)?;
        let data = out(data)?;
        let event = queue.enqueue_mem_buffer_write(buffer, blocking, offset, data, wait_list)?;
        hand_out(event, out_event)
    })
}

/// 阻塞读缓冲区
pub fn enqueue_mem_buffer_read(
    queue: Option<&Queue>,
    buffer: Option<&Mem>,
    offset: usize,
    dst: Option<&mut [u8]>,
    wait_list: &[Event],
    out_event: Option<&mut Option<Event>>,
) -> UrResult {
    traced("urEnqueueMemBufferRead", move || {
        let queue = handle(queue)?;
        let buffer = handle(buffer)?;
        let dst = out(dst)?;
        let event = queue.enqueue_mem_buffer_read(buffer, offset, dst, wait_list)?;
        hand_out(event, out_event)
    })
}

pub fn enqueue_usm_fill(
    queue: Option<&Queue>,
    ptr: UsmPtr,
    pattern: Option<&[u8]>,
    size: usize,
    wait_list: &[Event],
    out_event: Option<&mut Option<Event>>,
) -> UrResult {
    traced("urEnqueueUSMFill", move || {
        let queue = handle(queue)?;
        let pattern = out(pattern)?;
        let event = queue.enqueue_usm_fill(ptr, pattern, size, wait_list)?;
        hand_out(event, out_event)
    })
}

pub fn enqueue_usm_memcpy(
    queue: Option<&Queue>,
    blocking: bool,
    dst: UsmPtr,
    src: UsmPtr,
    size: usize,
    wait_list: &[Event],
    out_event: Option<&mut Option<Event>>,
) -> UrResult {
    traced("urEnqueueUSMMemcpy", move || {
        let queue = handle(queue)?;
        let event = queue.enqueue_usm_memcpy(blocking, dst, src, size, wait_list)?;
        hand_out(event, out_event)
    })
}

pub fn enqueue_events_wait(
    queue: Option<&Queue>,
    wait_list: &[Event],
    out_event: Option<&mut Option<Event>>,
) -> UrResult {
    traced("urEnqueueEventsWait", move || {
        let event = handle(queue)?.enqueue_events_wait(wait_list)?;
        hand_out(event, out_event)
    })
}

pub fn enqueue_events_wait_with_barrier(
    queue: Option<&Queue>,
    wait_list: &[Event],
    out_event: Option<&mut Option<Event>>,
) -> UrResult {
    traced("urEnqueueEventsWaitWithBarrier", move || {
        let event = handle(queue)?.enqueue_events_wait_with_barrier(wait_list)?;
        hand_out(event, out_event)
    })
}

// ============================================================================
// 统一共享内存
// ============================================================================

fn usm_alloc(
    entry: &str,
    usm_type: UsmType,
    context: Option<&Context>,
    device: Option<Option<&Device>>,
    desc: Option<&UsmDesc>,
    size: usize,
    ptr: Option<&mut UsmPtr>,
) -> UrResult {
    traced(entry, move || {
        let context = handle(context)?;
        let device = match device {
            Some(device) => Some(handle(device)?),
            None => None,
        };
        let ptr = out(ptr)?;
        *ptr = context.usm_alloc(usm_type, device, desc, size)?;
        Ok(())
    })
}

/// 分配主机内存
pub fn usm_host_alloc(
    context: Option<&Context>,
    desc: Option<&UsmDesc>,
    size: usize,
    ptr: Option<&mut UsmPtr>,
) -> UrResult {
    usm_alloc("urUSMHostAlloc", UsmType::Host, context, None, desc, size, ptr)
}

/// 分配设备内存
pub fn usm_device_alloc(
    context: Option<&Context>,
    device: Option<&Device>,
    desc: Option<&UsmDesc>,
    size: usize,
    ptr: Option<&mut UsmPtr>,
) -> UrResult {
    usm_alloc("urUSMDeviceAlloc", UsmType::Device, context, Some(device), desc, size, ptr)
}

/// 分配共享内存
///
/// 校验顺序：上下文与设备句柄、输出指针、大小、对齐与建议。
pub fn usm_shared_alloc(
    context: Option<&Context>,
    device: Option<&Device>,
    desc: Option<&UsmDesc>,
    size: usize,
    ptr: Option<&mut UsmPtr>,
) -> UrResult {
    usm_alloc("urUSMSharedAlloc", UsmType::Shared, context, Some(device), desc, size, ptr)
}

pub fn usm_free(context: Option<&Context>, ptr: UsmPtr) -> UrResult {
    traced("urUSMFree", move || handle(context)?.usm_free(ptr))
}

pub fn usm_get_mem_alloc_info(
    context: Option<&Context>,
    ptr: UsmPtr,
    prop: UsmAllocInfo,
    prop_size: usize,
    prop_value: Option<&mut [u8]>,
    prop_size_ret: Option<&mut usize>,
) -> UrResult {
    traced("urUSMGetMemAllocInfo", move || {
        let context = handle(context)?;
        ur_assert!(!ptr.is_null(), UrError::InvalidNullPointer);
        context.usm_get_alloc_info(ptr, prop, info_helper(prop_size, prop_value, prop_size_ret)?)
    })
}

// ============================================================================
// 拆除
// ============================================================================

/// 拆除平台缓存和所有适配器，可以重复调用
pub fn tear_down() -> UrResult {
    traced("urTearDown", || {
        PlatformRegistry::global().tear_down();
        Ok(())
    })
}
