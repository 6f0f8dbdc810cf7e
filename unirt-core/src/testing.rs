//! 核心层单元测试使用的模拟后端
//!
//! 模拟后端不执行任何内存操作：USM 地址由递增计数器生成，
//! 队列在提交时按顺序同步完成每个操作；扣留模式下提交的批次
//! 留在 [`HeldWork`] 中，直到测试调用 [`complete_held`]。

use crate::adapter::*;
use crate::device::{DeviceProperties, DeviceType, UsmCapabilities};
use crate::memory::MemFlags;
use crate::platform::PlatformProperties;
use crate::queue::{QueueProperties, Submission};
use crate::usm::{UsmAllocRequest, UsmPtr};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use unirt_common::align_up;
use unirt_error::{UrError, UrResult};

pub(crate) const MOCK_MAX_ALLOC: u64 = 1 << 20;

/// 已提交但尚未执行的操作
pub(crate) type HeldWork = Arc<Mutex<Vec<Submission>>>;

/// 按提交顺序执行扣留的操作，返回执行的数量
pub(crate) fn complete_held(held: &HeldWork) -> usize {
    let batch = std::mem::take(&mut *held.lock());
    let count = batch.len();
    for submission in batch {
        run_submission(submission);
    }
    count
}

fn run_submission(Submission { signal, .. }: Submission) {
    signal.running();
    let result = signal.wait_dependencies();
    signal.complete(result);
}

pub(crate) struct MockAdapter {
    pub devices: usize,
    pub fail: bool,
    pub enumerations: AtomicUsize,
    held: Option<HeldWork>,
}

impl MockAdapter {
    pub fn new(devices: usize) -> Arc<Self> {
        Arc::new(Self {
            devices,
            fail: false,
            enumerations: AtomicUsize::new(0),
            held: None,
        })
    }

    /// 单设备适配器，其队列只记录提交而不执行
    pub fn holding() -> (Arc<Self>, HeldWork) {
        let held = HeldWork::default();
        let adapter = Arc::new(Self {
            devices: 1,
            fail: false,
            enumerations: AtomicUsize::new(0),
            held: Some(Arc::clone(&held)),
        });
        (adapter, held)
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            devices: 0,
            fail: true,
            enumerations: AtomicUsize::new(0),
            held: None,
        })
    }
}

impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn backend(&self) -> AdapterBackend {
        AdapterBackend::NativeCpu
    }

    fn enumerate_platforms(&self) -> UrResult<Vec<Arc<dyn PlatformBackend>>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(UrError::DeviceLost);
        }
        let platform: Arc<dyn PlatformBackend> = Arc::new(MockPlatform {
            devices: self.devices,
            held: self.held.clone(),
        });
        Ok(vec![platform])
    }
}

struct MockPlatform {
    devices: usize,
    held: Option<HeldWork>,
}

impl PlatformBackend for MockPlatform {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn query_properties(&self, props: &mut PlatformProperties) -> UrResult {
        props.name = "Mock Platform".to_string();
        props.vendor = "UniRT".to_string();
        props.version = "1.0".to_string();
        props.backend = AdapterBackend::NativeCpu;
        Ok(())
    }

    fn enumerate_devices(&self) -> UrResult<Vec<Arc<dyn DeviceBackend>>> {
        Ok((0..self.devices)
            .map(|index| Arc::new(MockDevice { index }) as Arc<dyn DeviceBackend>)
            .collect())
    }

    fn create_context(
        &self,
        _devices: &[Arc<dyn DeviceBackend>],
    ) -> UrResult<Box<dyn ContextBackend>> {
        Ok(Box::new(MockContext {
            next: Mutex::new(0x1000_0000),
            live: Mutex::new(HashSet::new()),
            held: self.held.clone(),
        }))
    }
}

struct MockDevice {
    index: usize,
}

impl DeviceBackend for MockDevice {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn query_properties(&self, props: &mut DeviceProperties) -> UrResult {
        props.device_type = DeviceType::Cpu;
        props.name = format!("Mock Device {}", self.index);
        props.max_compute_units = 4;
        props.max_work_item_sizes = vec![64, 64, 64];
        props.max_mem_alloc_size = MOCK_MAX_ALLOC;
        props.global_mem_size = MOCK_MAX_ALLOC * 4;
        props.usm_host_support = UsmCapabilities::ACCESS;
        props.usm_device_support = UsmCapabilities::ACCESS;
        props.usm_single_shared_support = UsmCapabilities::ACCESS;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MockContext {
    next: Mutex<usize>,
    live: Mutex<HashSet<usize>>,
    held: Option<HeldWork>,
}

impl ContextBackend for MockContext {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn usm_alloc(&self, request: &UsmAllocRequest<'_>) -> UrResult<UsmPtr> {
        let mut next = self.next.lock();
        let start = align_up(*next, request.align.max(64)).ok_or(UrError::OutOfResources)?;
        *next = start + request.size;
        self.live.lock().insert(start);
        Ok(UsmPtr::from_addr(start))
    }

    fn usm_free(&self, ptr: UsmPtr) -> UrResult {
        if self.live.lock().remove(&ptr.addr()) {
            Ok(())
        } else {
            Err(UrError::InvalidMemObject)
        }
    }

    fn create_buffer(
        &self,
        _flags: MemFlags,
        size: usize,
        _host_data: Option<&[u8]>,
    ) -> UrResult<Arc<dyn MemBackend>> {
        Ok(Arc::new(MockMem { size }))
    }

    fn create_queue(
        &self,
        _device: &Arc<dyn DeviceBackend>,
        _props: &QueueProperties,
    ) -> UrResult<Box<dyn QueueBackend>> {
        Ok(Box::new(MockQueue {
            submitted: AtomicUsize::new(0),
            held: self.held.clone(),
        }))
    }
}

struct MockMem {
    size: usize,
}

impl MemBackend for MockMem {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn size(&self) -> usize {
        self.size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MockQueue {
    submitted: AtomicUsize,
    held: Option<HeldWork>,
}

impl QueueBackend for MockQueue {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }

    fn create_event(&self) -> UrResult<Box<dyn EventBackend>> {
        Ok(Box::new(MockEvent { _id: 1 }))
    }

    fn submit(&self, batch: Vec<Submission>) -> UrResult {
        self.submitted.fetch_add(batch.len(), Ordering::SeqCst);
        match &self.held {
            Some(held) => held.lock().extend(batch),
            None => batch.into_iter().for_each(run_submission),
        }
        Ok(())
    }

    fn finish(&self) -> UrResult {
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.held.as_ref().is_none_or(|held| held.lock().is_empty())
    }
}

struct MockEvent {
    _id: u32,
}

impl EventBackend for MockEvent {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextInfo};
    use crate::event::{CommandType, Event, EventSignal, EventStatus};
    use crate::handle::RefCounted;
    use crate::info::ReturnHelper;
    use crate::memory::Mem;
    use crate::platform::Platform;
    use crate::queue::Queue;
    use crate::registry::PlatformRegistry;
    use crate::usm::{UsmAdviceFlags, UsmDesc, UsmType};

    fn registry_with(adapters: &[Arc<MockAdapter>]) -> PlatformRegistry {
        let registry = PlatformRegistry::new();
        for adapter in adapters {
            registry.register_adapter(adapter.clone()).unwrap();
        }
        registry
    }

    fn first_platform(registry: &PlatformRegistry) -> Platform {
        registry.platforms().unwrap().remove(0)
    }

    #[test]
    fn test_registry_builds_once() {
        let adapter = MockAdapter::new(2);
        let registry = registry_with(&[adapter.clone()]);
        assert!(!registry.is_populated());

        assert_eq!(registry.platforms().unwrap().len(), 1);
        assert_eq!(registry.platforms().unwrap().len(), 1);
        assert!(registry.is_populated());
        assert_eq!(adapter.enumerations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_concurrent_first_query() {
        let adapter = MockAdapter::new(1);
        let registry = Arc::new(registry_with(&[adapter.clone()]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.platforms().unwrap().len())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 1);
        }
        assert_eq!(adapter.enumerations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_adapter_is_skipped() {
        let registry = registry_with(&[MockAdapter::failing(), MockAdapter::new(1)]);
        let platforms = registry.platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].properties().unwrap().name, "Mock Platform");
    }

    #[test]
    fn test_register_after_population_rejected() {
        let registry = registry_with(&[MockAdapter::new(1)]);
        registry.platforms().unwrap();
        assert_eq!(
            registry.register_adapter(MockAdapter::new(1)),
            Err(UrError::InvalidOperation)
        );
    }

    #[test]
    fn test_tear_down_invalidates_platforms() {
        let registry = registry_with(&[MockAdapter::new(1)]);
        let platform = first_platform(&registry);
        assert!(platform.devices().is_ok());

        registry.tear_down();
        registry.tear_down();
        assert_eq!(platform.properties().unwrap_err(), UrError::Uninitialized);
        assert!(registry.platforms().unwrap().is_empty());

        registry.register_adapter(MockAdapter::new(3)).unwrap();
        let rebuilt = first_platform(&registry);
        assert_eq!(rebuilt.devices().unwrap().len(), 3);
    }

    #[test]
    fn test_context_rejects_foreign_device() {
        let registry = registry_with(&[MockAdapter::new(1), MockAdapter::new(1)]);
        let platforms = registry.platforms().unwrap();
        let a = platforms[0].devices().unwrap()[0].clone();
        let b = platforms[1].devices().unwrap()[0].clone();

        assert_eq!(Context::create(&[]).unwrap_err(), UrError::InvalidValue);
        assert_eq!(
            Context::create(&[a.clone(), b]).unwrap_err(),
            UrError::InvalidDevice
        );
        let context = Context::create(&[a.clone(), a]).unwrap();
        assert_eq!(context.devices().len(), 1);
    }

    #[test]
    fn test_usm_allocations_hold_context() {
        let registry = registry_with(&[MockAdapter::new(1)]);
        let device = first_platform(&registry).devices().unwrap()[0].clone();
        let context = Context::create(std::slice::from_ref(&device)).unwrap();

        let desc = UsmDesc {
            align: 256,
            advice: UsmAdviceFlags::SET_READ_MOSTLY | UsmAdviceFlags::BIAS_CACHED,
            ..UsmDesc::default()
        };
        let ptr = context
            .usm_alloc(UsmType::Shared, Some(&device), Some(&desc), 4096)
            .unwrap();
        assert_eq!(ptr.addr() % 256, 0);
        assert_eq!(context.reference_count(), 2);

        // 外部引用释放后，分配仍然使上下文保持有效
        context.release().unwrap();
        assert!(context.ensure_alive().is_ok());
        context.usm_free(ptr).unwrap();
        assert_eq!(context.ensure_alive(), Err(UrError::InvalidContext));
    }

    #[test]
    fn test_usm_validation_leaves_no_allocation() {
        let registry = registry_with(&[MockAdapter::new(1)]);
        let device = first_platform(&registry).devices().unwrap()[0].clone();
        let context = Context::create(std::slice::from_ref(&device)).unwrap();

        let oversized = (MOCK_MAX_ALLOC + 1) as usize;
        assert_eq!(
            context.usm_alloc(UsmType::Device, Some(&device), None, oversized),
            Err(UrError::InvalidUsmSize)
        );
        let bad_align = UsmDesc {
            align: 5,
            ..UsmDesc::default()
        };
        assert_eq!(
            context.usm_alloc(UsmType::Host, None, Some(&bad_align), 64),
            Err(UrError::InvalidValue)
        );
        assert_eq!(
            context.usm_alloc(UsmType::Shared, None, None, 64),
            Err(UrError::InvalidNullHandle)
        );
        assert_eq!(context.allocation_count(), 0);
        assert_eq!(context.reference_count(), 1);
    }

    #[test]
    fn test_queue_batches_until_flush() {
        let registry = registry_with(&[MockAdapter::new(1)]);
        let device = first_platform(&registry).devices().unwrap()[0].clone();
        let context = Context::create(std::slice::from_ref(&device)).unwrap();
        let queue = Queue::create(&context, &device, None).unwrap();

        let event = queue.enqueue_events_wait(&[]).unwrap();
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(event.status(), EventStatus::Queued);

        queue.flush().unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(event.status(), EventStatus::Complete);
        queue.flush().unwrap();

        event.release().unwrap();
        queue.release().unwrap();
        assert_eq!(queue.flush(), Err(UrError::InvalidQueue));
        assert_eq!(context.reference_count(), 1);
    }

    #[test]
    fn test_flush_does_not_wait_for_completion() {
        let (adapter, held) = MockAdapter::holding();
        let registry = registry_with(&[adapter]);
        let device = first_platform(&registry).devices().unwrap()[0].clone();
        let context = Context::create(std::slice::from_ref(&device)).unwrap();
        let queue = Queue::create(&context, &device, None).unwrap();

        let event = queue.enqueue_events_wait(&[]).unwrap();
        assert_eq!(event.status(), EventStatus::Queued);

        queue.flush().unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(event.status(), EventStatus::Submitted);
        assert!(!queue.is_empty());

        assert_eq!(complete_held(&held), 1);
        assert_eq!(event.status(), EventStatus::Complete);
        assert!(queue.is_empty());
        assert_eq!(event.reference_count(), 1);

        event.release().unwrap();
        queue.release().unwrap();
    }

    #[test]
    fn test_event_wait_flushes_owning_queue() {
        let registry = registry_with(&[MockAdapter::new(1)]);
        let device = first_platform(&registry).devices().unwrap()[0].clone();
        let context = Context::create(std::slice::from_ref(&device)).unwrap();
        let queue = Queue::create(&context, &device, None).unwrap();

        let first = queue.enqueue_events_wait(&[]).unwrap();
        let second = queue.enqueue_events_wait(std::slice::from_ref(&first)).unwrap();
        // 依赖持有内部引用
        assert_eq!(first.reference_count(), 3);

        Event::wait(&[second.clone()]).unwrap();
        assert_eq!(first.status(), EventStatus::Complete);
        assert_eq!(first.reference_count(), 1);
        assert_eq!(second.reference_count(), 1);
    }

    #[test]
    fn test_dropped_signal_fails_dependents() {
        let registry = registry_with(&[MockAdapter::new(1)]);
        let device = first_platform(&registry).devices().unwrap()[0].clone();
        let context = Context::create(std::slice::from_ref(&device)).unwrap();
        let queue = Queue::create(&context, &device, None).unwrap();

        let lost = Event::new(&queue, CommandType::EventsWait).unwrap();
        lost.retain().unwrap();
        let signal = EventSignal::new(lost.clone(), Vec::new(), Vec::new());
        signal.submitted();
        assert_eq!(lost.status(), EventStatus::Submitted);

        drop(signal);
        assert_eq!(lost.status(), EventStatus::Error(UrError::DeviceLost));
        assert_eq!(lost.reference_count(), 1);
        assert!(lost.status().execution_status() < 0);

        let dependent = queue.enqueue_events_wait(std::slice::from_ref(&lost)).unwrap();
        assert_eq!(Event::wait(&[dependent.clone()]), Err(UrError::DeviceLost));
        assert_eq!(
            Event::wait(&[lost.clone(), dependent.clone()]),
            Err(UrError::DeviceLost)
        );

        dependent.release().unwrap();
        lost.release().unwrap();
        queue.release().unwrap();
        assert_eq!(context.reference_count(), 1);
    }

    #[test]
    fn test_buffer_write_bounds() {
        let registry = registry_with(&[MockAdapter::new(1)]);
        let device = first_platform(&registry).devices().unwrap()[0].clone();
        let context = Context::create(std::slice::from_ref(&device)).unwrap();
        let queue = Queue::create(&context, &device, None).unwrap();
        let buffer = Mem::buffer_create(&context, MemFlags::READ_WRITE, 16, None).unwrap();

        assert_eq!(
            queue
                .enqueue_mem_buffer_write(&buffer, false, 8, &[0u8; 16], &[])
                .unwrap_err(),
            UrError::InvalidSize
        );
        let event = queue
            .enqueue_mem_buffer_write(&buffer, true, 0, &[1u8; 16], &[])
            .unwrap();
        assert_eq!(event.status(), EventStatus::Complete);
        assert_eq!(buffer.reference_count(), 1);
    }

    #[test]
    fn test_context_info_devices() {
        let registry = registry_with(&[MockAdapter::new(2)]);
        let devices = first_platform(&registry).devices().unwrap().to_vec();
        let context = Context::create(&devices).unwrap();

        let mut size = 0usize;
        context
            .get_info(ContextInfo::Devices, ReturnHelper::new(0, None, Some(&mut size)))
            .unwrap();
        assert_eq!(size, 2 * std::mem::size_of::<usize>());

        let mut count = [0u8; 4];
        context
            .get_info(ContextInfo::NumDevices, ReturnHelper::new(4, Some(&mut count), None))
            .unwrap();
        assert_eq!(u32::from_ne_bytes(count), 2);
    }
}
