//! Shared fixtures for the host adapter integration tests

#![allow(dead_code)]

use unirt_core::{Context, Device, DeviceType, Platform, Queue, api};

/// The host platform and every device it exposes
pub struct Fixture {
    pub platform: Platform,
    pub devices: Vec<Device>,
}

/// Registers the host adapter (once per process) and enumerates it
pub fn setup() -> Fixture {
    unirt_common::init_logging();
    unirt_host::register().expect("host adapter registration");

    let mut count = 0u32;
    api::platform_get(0, None, Some(&mut count)).unwrap();
    assert!(count >= 1);
    let mut platforms = vec![None; count as usize];
    api::platform_get(count, Some(&mut platforms), None).unwrap();
    let platform = platforms.into_iter().flatten().next().unwrap();

    let mut count = 0u32;
    api::device_get(Some(&platform), DeviceType::All, 0, None, Some(&mut count)).unwrap();
    let mut devices = vec![None; count as usize];
    api::device_get(Some(&platform), DeviceType::All, count, Some(&mut devices), None).unwrap();

    Fixture {
        platform,
        devices: devices.into_iter().flatten().collect(),
    }
}

/// A context and queue on one device; both released on drop
pub struct DeviceEnv {
    pub device: Device,
    pub context: Context,
    pub queue: Queue,
}

impl DeviceEnv {
    pub fn new(device: &Device) -> Self {
        let mut context = None;
        api::context_create(Some(std::slice::from_ref(device)), Some(&mut context)).unwrap();
        let context = context.unwrap();

        let mut queue = None;
        api::queue_create(Some(&context), Some(device), None, Some(&mut queue)).unwrap();

        Self {
            device: device.clone(),
            context,
            queue: queue.unwrap(),
        }
    }
}

impl Drop for DeviceEnv {
    fn drop(&mut self) {
        let _ = api::queue_release(Some(&self.queue));
        let _ = api::context_release(Some(&self.context));
    }
}

/// Runs `body` once per device, the way device-parameterized conformance suites do
pub fn for_each_device(mut body: impl FnMut(&DeviceEnv)) {
    let fixture = setup();
    for device in &fixture.devices {
        let env = DeviceEnv::new(device);
        body(&env);
    }
}
