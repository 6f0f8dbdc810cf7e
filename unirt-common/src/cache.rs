//! 惰性不可变缓存
//!
//! 包装一个值类型：第一次读取时运行注册的初始化函数（恰好一次），
//! 之后所有读取都只返回已存储的数据。用于平台/设备能力等
//! 在其所有者生命周期内不会改变的后端元数据。

use std::fmt;
use std::sync::OnceLock;
use unirt_error::{UrError, UrResult};

/// 初始化函数，接收待初始化数据的可变引用
pub type InitFunction<T> = Box<dyn Fn(&mut T) -> UrResult + Send + Sync>;

/// 第一次访问时计算、此后只读的数据
///
/// 并发的首次访问会阻塞到初始化完成，所有调用者观察到同一个值。
/// 初始化失败时错误会返回给本次以及之后的所有访问者，不会自动重试。
pub struct ImmutableCache<T> {
    compute: InitFunction<T>,
    value: OnceLock<UrResult<T>>,
}

impl<T: Default> ImmutableCache<T> {
    /// 使用初始化函数创建空缓存
    ///
    /// # 示例
    /// ```
    /// use unirt_common::ImmutableCache;
    ///
    /// let cache: ImmutableCache<Vec<u32>> = ImmutableCache::new(|v: &mut Vec<u32>| {
    ///     v.extend([1, 2, 3]);
    ///     Ok(())
    /// });
    /// assert_eq!(cache.get().unwrap().len(), 3);
    /// ```
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(&mut T) -> UrResult + Send + Sync + 'static,
    {
        Self {
            compute: Box::new(compute),
            value: OnceLock::new(),
        }
    }

    /// 读取缓存数据，必要时触发初始化
    pub fn get(&self) -> UrResult<&T> {
        self.value
            .get_or_init(|| {
                let mut data = T::default();
                (self.compute)(&mut data).map(|()| data)
            })
            .as_ref()
            .map_err(|e: &UrError| *e)
    }

    /// 初始化是否已经完成（无论成功与否）
    pub fn is_computed(&self) -> bool {
        self.value.get().is_some()
    }
}

impl<T: fmt::Debug> fmt::Debug for ImmutableCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmutableCache")
            .field("value", &self.value.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Props {
        compute_units: u32,
        name: String,
    }

    #[test]
    fn test_lazy_until_first_access() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = ImmutableCache::new(move |p: &mut Props| {
            counter.fetch_add(1, Ordering::SeqCst);
            p.compute_units = 8;
            p.name = "host".to_string();
            Ok(())
        });

        assert!(!cache.is_computed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(cache.get().unwrap().compute_units, 8);
        assert_eq!(cache.get().unwrap().name, "host");
        assert!(cache.is_computed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_sticky() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache: ImmutableCache<Props> = ImmutableCache::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(UrError::DeviceLost)
        });

        assert_eq!(cache.get().unwrap_err(), UrError::DeviceLost);
        assert_eq!(cache.get().unwrap_err(), UrError::DeviceLost);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
