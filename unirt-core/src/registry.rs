//! 平台注册表（Dispatch Registry）
//!
//! 进程级的适配器注册和平台缓存。平台列表在第一次查询时构建，且只构建一次：
//! 构建过程由自旋锁保护，完成后设置 `populated` 标志，之后的查询
//! 只需读取标志和共享锁即可。单个适配器枚举失败时记录警告并跳过，
//! 不影响其他适配器。`tear_down` 显式拆除缓存，可以重复调用。

use crate::adapter::Adapter;
use crate::platform::Platform;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use unirt_common::{SpinLock, UrSharedMutex};
use unirt_error::{UrError, UrResult, die, ur_assert};

static GLOBAL_REGISTRY: PlatformRegistry = PlatformRegistry::new();

/// 适配器注册表与平台缓存
pub struct PlatformRegistry {
    build_lock: SpinLock,
    populated: AtomicBool,
    adapters: RwLock<Vec<Arc<dyn Adapter>>>,
    platforms: UrSharedMutex<Vec<Platform>>,
}

impl PlatformRegistry {
    /// 创建空注册表
    pub const fn new() -> Self {
        Self {
            build_lock: SpinLock::new(),
            populated: AtomicBool::new(false),
            adapters: RwLock::new(Vec::new()),
            platforms: UrSharedMutex::const_new(
                <unirt_common::RawUrRwLock as parking_lot::lock_api::RawRwLock>::INIT,
                Vec::new(),
            ),
        }
    }

    /// 进程级注册表
    pub fn global() -> &'static PlatformRegistry {
        &GLOBAL_REGISTRY
    }

    /// 注册后端适配器
    ///
    /// 平台缓存一旦构建就不再接受新的适配器，返回 `InvalidOperation`。
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) -> UrResult {
        let _guard = self.build_lock.lock();
        if self.populated.load(Ordering::Acquire) {
            tracing::warn!(
                "Adapter {} registered after the platform cache was built",
                adapter.name()
            );
            return Err(UrError::InvalidOperation);
        }
        tracing::debug!("Registered adapter {}", adapter.name());
        self.adapters.write().push(adapter);
        Ok(())
    }

    /// 同名适配器尚未注册时注册，返回是否新注册
    pub fn register_adapter_once(&self, adapter: Arc<dyn Adapter>) -> UrResult<bool> {
        let _guard = self.build_lock.lock();
        if self
            .adapters
            .read()
            .iter()
            .any(|registered| registered.name() == adapter.name())
        {
            return Ok(false);
        }
        ur_assert!(
            !self.populated.load(Ordering::Acquire),
            UrError::InvalidOperation
        );
        tracing::debug!("Registered adapter {}", adapter.name());
        self.adapters.write().push(adapter);
        Ok(true)
    }

    /// 已注册的适配器数量
    pub fn adapter_count(&self) -> usize {
        self.adapters.read().len()
    }

    /// 平台缓存是否已经构建
    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    /// 获取所有平台，必要时构建平台缓存
    pub fn platforms(&self) -> UrResult<Vec<Platform>> {
        if !self.populated.load(Ordering::Acquire) {
            self.populate();
        }
        Ok(self.platforms.read().clone())
    }

    fn populate(&self) {
        let _guard = self.build_lock.lock();
        if self.populated.load(Ordering::Acquire) {
            return;
        }

        let adapters = self.adapters.read();
        if adapters.is_empty() {
            // 没有适配器时保持未构建状态，之后仍可注册
            return;
        }

        let mut platforms = self.platforms.write();
        if !platforms.is_empty() {
            die("platform cache holds entries but was never marked populated");
        }

        for adapter in adapters.iter() {
            match adapter.enumerate_platforms() {
                Ok(backends) => {
                    tracing::debug!(
                        "Adapter {} exposes {} platforms",
                        adapter.name(),
                        backends.len()
                    );
                    platforms.extend(
                        backends
                            .into_iter()
                            .map(|backend| Platform::new(adapter, backend)),
                    );
                }
                Err(e) => {
                    tracing::warn!("Skipping adapter {}: {}", adapter.name(), e);
                }
            }
        }

        self.populated.store(true, Ordering::Release);
    }

    /// 拆除平台缓存和所有适配器
    ///
    /// 之后持有的平台、设备句柄上的查询返回 `Uninitialized`。
    /// 可以重复调用；拆除后可以重新注册适配器。
    pub fn tear_down(&self) {
        let _guard = self.build_lock.lock();
        let adapters: Vec<_> = std::mem::take(&mut *self.adapters.write());
        self.platforms.write().clear();
        self.populated.store(false, Ordering::Release);

        for adapter in &adapters {
            tracing::debug!("Tearing down adapter {}", adapter.name());
            adapter.tear_down();
        }
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::new()
    }
}
