//! Single-Thread Mode Tests
//!
//! Runs in its own binary so the process configuration can be installed
//! before anything reads it:
//! - UrMutex / UrSharedMutex never block while a guard is held
//! - releasing an unheld lock is a no-op

use std::sync::Once;

use unirt_common::{RuntimeConfig, UrMutex, UrSharedMutex, single_thread_mode};

static INSTALL: Once = Once::new();

fn enable_single_thread_mode() {
    INSTALL.call_once(|| {
        RuntimeConfig::install(RuntimeConfig {
            single_thread_mode: true,
            ..RuntimeConfig::default()
        })
        .unwrap();
    });
    assert!(single_thread_mode());
}

#[test]
fn test_mutex_try_lock_succeeds_while_held() {
    enable_single_thread_mode();
    let mutex = UrMutex::new(7u32);

    let held = mutex.lock();
    let second = mutex.try_lock();
    assert!(second.is_some());
    drop(second);
    drop(held);

    *mutex.lock() += 1;
    assert_eq!(*mutex.lock(), 8);
}

#[test]
fn test_shared_mutex_try_write_succeeds_while_read_held() {
    enable_single_thread_mode();
    let lock = UrSharedMutex::new(vec![1u8, 2, 3]);

    let reader = lock.read();
    assert!(lock.try_write().is_some());
    assert!(lock.try_read().is_some());
    assert_eq!(reader.len(), 3);
}

#[test]
fn test_shared_mutex_try_read_succeeds_while_write_held() {
    enable_single_thread_mode();
    let lock = UrSharedMutex::new(0u64);

    let writer = lock.write();
    assert!(lock.try_read().is_some());
    assert!(lock.try_write().is_some());
    drop(writer);

    *lock.write() = 42;
    assert_eq!(*lock.read(), 42);
}

#[test]
fn test_unlock_without_lock_is_harmless() {
    enable_single_thread_mode();
    let mutex = UrMutex::new(String::from("adapter"));
    let lock = UrSharedMutex::new(5i32);

    // SAFETY: 单线程模式下解锁是空操作，不会破坏锁状态
    unsafe {
        mutex.force_unlock();
        lock.force_unlock_read();
        lock.force_unlock_write();
    }

    assert_eq!(mutex.lock().as_str(), "adapter");
    assert!(mutex.try_lock().is_some());
    assert_eq!(*lock.read(), 5);
    assert!(lock.try_write().is_some());
}
