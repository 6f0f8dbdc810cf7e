//! 引用计数句柄
//!
//! 上下文、队列、事件和内存对象都带有显式引用计数：创建时为 1，
//! `retain` 加一，`release` 减一，降到 0 时对象恰好被销毁一次。
//! 计数永远不会变为负数；对已销毁对象的操作返回该类句柄的无效错误码。

use std::sync::atomic::{AtomicU32, Ordering};
use unirt_error::{UrError, UrResult};

/// 原子引用计数
#[derive(Debug)]
pub struct RefCount {
    count: AtomicU32,
}

impl RefCount {
    /// 新对象的计数为 1
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(1),
        }
    }

    /// 当前计数
    pub fn load(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// 增加一次引用；对象已销毁或计数溢出时返回 `false`
    pub fn retain(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c == 0 { None } else { c.checked_add(1) }
            })
            .is_ok()
    }

    /// 减少一次引用
    ///
    /// 返回 `Some(true)` 表示这次释放使计数降到 0；
    /// 对象已经销毁时返回 `None`，计数保持为 0。
    pub fn release(&self) -> Option<bool> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .ok()
            .map(|previous| previous == 1)
    }

    /// 对象是否已经销毁
    pub fn is_destroyed(&self) -> bool {
        self.load() == 0
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// 引用计数句柄的公共契约
pub trait RefCounted {
    /// 对已销毁句柄操作时返回的错误
    const INVALID_HANDLE: UrError;

    /// 句柄的引用计数
    fn ref_count(&self) -> &RefCount;

    /// 计数降到 0 时调用，恰好一次
    fn on_destroy(&self);

    /// 增加一次引用
    fn retain(&self) -> UrResult {
        if self.ref_count().retain() {
            Ok(())
        } else {
            Err(Self::INVALID_HANDLE)
        }
    }

    /// 释放一次引用，最后一次释放销毁对象
    fn release(&self) -> UrResult {
        match self.ref_count().release() {
            Some(true) => {
                self.on_destroy();
                Ok(())
            }
            Some(false) => Ok(()),
            None => Err(Self::INVALID_HANDLE),
        }
    }

    /// 当前引用计数
    fn reference_count(&self) -> u32 {
        self.ref_count().load()
    }

    /// 句柄仍然有效时返回 `Ok`
    fn ensure_alive(&self) -> UrResult {
        if self.ref_count().is_destroyed() {
            Err(Self::INVALID_HANDLE)
        } else {
            Ok(())
        }
    }
}

/// 对一组句柄各增加一次引用；中途失败时撤销已增加的引用
pub(crate) fn retain_all<H: RefCounted>(handles: &[H]) -> UrResult {
    for (index, handle) in handles.iter().enumerate() {
        if let Err(e) = handle.retain() {
            for retained in &handles[..index] {
                let _ = retained.release();
            }
            return Err(e);
        }
    }
    Ok(())
}

/// 释放一组句柄的内部引用，错误只记录不传播
pub(crate) fn release_all<H: RefCounted>(handles: &[H]) {
    for handle in handles {
        if let Err(e) = handle.release() {
            tracing::warn!("Dropping internal reference failed: {}", e);
        }
    }
}
