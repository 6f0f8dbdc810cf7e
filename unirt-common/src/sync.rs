//! 可配置的同步原语
//!
//! `UrMutex` / `UrSharedMutex` 的行为与 `parking_lot` 的互斥锁、读写锁一致；
//! 当进程处于单线程模式时，所有加锁、解锁操作变为直接成功的空操作。
//! 调用者开启单线程模式即保证不会并发访问，否则行为未定义。
//! 因此只有调用者线程访问的状态可以使用它们；后端工作线程会触及的
//! 状态必须使用 `parking_lot` 的真实锁。
//!
//! `SpinLock` 只包含一个原子布尔量，可以 `const` 构造，适合放在 `static` 中。

use crate::config::single_thread_mode;
use parking_lot::lock_api::{self, GuardNoSend, RawMutex as _, RawRwLock as _};
use std::sync::atomic::{AtomicBool, Ordering};

// ============================================================================
// 互斥锁
// ============================================================================

/// 在单线程模式下退化为空操作的原始互斥锁
pub struct RawUrMutex {
    inner: parking_lot::RawMutex,
}

// SAFETY: 非单线程模式下所有操作委托给 parking_lot::RawMutex；
// 单线程模式下由调用者保证不存在并发访问。
unsafe impl lock_api::RawMutex for RawUrMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        inner: parking_lot::RawMutex::INIT,
    };

    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock(&self) {
        if !single_thread_mode() {
            self.inner.lock();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        single_thread_mode() || self.inner.try_lock()
    }

    #[inline]
    unsafe fn unlock(&self) {
        if !single_thread_mode() {
            // SAFETY: 调用者持有锁
            unsafe { self.inner.unlock() }
        }
    }
}

/// 可配置互斥锁
pub type UrMutex<T> = lock_api::Mutex<RawUrMutex, T>;
/// `UrMutex` 的守卫
pub type UrMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawUrMutex, T>;

// ============================================================================
// 读写锁
// ============================================================================

/// 在单线程模式下退化为空操作的原始读写锁
pub struct RawUrRwLock {
    inner: parking_lot::RawRwLock,
}

// SAFETY: 同 RawUrMutex
unsafe impl lock_api::RawRwLock for RawUrRwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        inner: parking_lot::RawRwLock::INIT,
    };

    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock_shared(&self) {
        if !single_thread_mode() {
            self.inner.lock_shared();
        }
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        single_thread_mode() || self.inner.try_lock_shared()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        if !single_thread_mode() {
            // SAFETY: 调用者持有共享锁
            unsafe { self.inner.unlock_shared() }
        }
    }

    #[inline]
    fn lock_exclusive(&self) {
        if !single_thread_mode() {
            self.inner.lock_exclusive();
        }
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        single_thread_mode() || self.inner.try_lock_exclusive()
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        if !single_thread_mode() {
            // SAFETY: 调用者持有独占锁
            unsafe { self.inner.unlock_exclusive() }
        }
    }
}

/// 可配置读写锁，适合读多写少的状态
pub type UrSharedMutex<T> = lock_api::RwLock<RawUrRwLock, T>;
/// `UrSharedMutex` 的共享守卫
pub type UrReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawUrRwLock, T>;
/// `UrSharedMutex` 的独占守卫
pub type UrWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawUrRwLock, T>;

// ============================================================================
// 自旋锁
// ============================================================================

/// 基于单个原子布尔量的最小自旋锁
///
/// 构造和析构都是平凡的，因此可以直接作为进程级 `static` 使用，
/// 不依赖任何初始化顺序。等待时让出当前线程时间片。
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// 创建未加锁的自旋锁
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// 获取锁，直到成功为止
    pub fn lock(&self) -> SpinLockGuard<'_> {
        while self.locked.swap(true, Ordering::Acquire) {
            std::thread::yield_now();
        }
        SpinLockGuard { lock: self }
    }

    /// 尝试获取锁，失败立即返回 `None`
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinLockGuard { lock: self })
        }
    }

    /// 当前是否被持有
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// 自旋锁守卫，离开作用域时释放锁
#[must_use = "the spin lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
