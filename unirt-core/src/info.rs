//! 两阶段属性查询协议
//!
//! 所有 `*_get_info` 入口点共用同一套写回规则：
//! - 提供了输出缓冲区时，其容量（声明容量与切片长度取较小值）必须能容纳值，
//!   否则返回 `InvalidValue`，缓冲区保持不变
//! - 提供了大小输出时，总是写入值的字节数
//! - 字符串按字节写入并以 NUL 结尾，长度包含 NUL
//!
//! 调用者通常先只传大小输出查询所需字节数，再分配缓冲区取值。

use unirt_common::UrCast;
use unirt_error::{UrError, UrResult, ur_assert};

/// 可以按本机字节序写入查询缓冲区的标量
pub trait InfoScalar: Copy {
    /// 写入的字节数
    const SIZE: usize;

    /// 写入恰好 `SIZE` 字节
    fn write_ne(self, out: &mut [u8]);
}

macro_rules! impl_info_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl InfoScalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_ne(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_info_scalar!(u8, u16, u32, u64, usize, i32, i64, f32, f64);

impl InfoScalar for bool {
    const SIZE: usize = 1;

    fn write_ne(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }
}

/// 查询结果写回辅助
///
/// 持有调用者提供的输出位置，并按协议写回一个值。每个辅助对象只写一次。
#[derive(Debug)]
pub struct ReturnHelper<'a> {
    capacity: usize,
    value: Option<&'a mut [u8]>,
    size_ret: Option<&'a mut usize>,
}

impl<'a> ReturnHelper<'a> {
    /// 使用 `(容量, 值缓冲区, 大小输出)` 三元组构造
    pub fn new(
        prop_size: usize,
        prop_value: Option<&'a mut [u8]>,
        prop_size_ret: Option<&'a mut usize>,
    ) -> Self {
        Self {
            capacity: prop_size,
            value: prop_value,
            size_ret: prop_size_ret,
        }
    }

    /// 使用输入输出大小参数构造：输入为容量，返回时写入值的字节数
    pub fn in_out(prop_size: &'a mut usize, prop_value: Option<&'a mut [u8]>) -> Self {
        Self {
            capacity: *prop_size,
            value: prop_value,
            size_ret: Some(prop_size),
        }
    }

    /// 写回单个标量
    pub fn scalar<T: InfoScalar>(self, value: T) -> UrResult {
        self.write(T::SIZE, false, |out| value.write_ne(out))
    }

    /// 写回标量数组
    pub fn array<T: InfoScalar>(self, values: &[T]) -> UrResult {
        self.write(values.len() * T::SIZE, false, |out| {
            for (chunk, value) in out.chunks_exact_mut(T::SIZE).zip(values) {
                value.write_ne(chunk);
            }
        })
    }

    /// 逐元素转换后写回数组
    ///
    /// 先确认容量足够，再把整个可用缓冲区清零，最后逐个写入转换后的元素。
    pub fn array_as<R, T>(self, values: &[T]) -> UrResult
    where
        R: InfoScalar,
        T: Copy + UrCast<R>,
    {
        self.write(values.len() * R::SIZE, true, |out| {
            for (chunk, value) in out.chunks_exact_mut(R::SIZE).zip(values) {
                value.ur_cast().write_ne(chunk);
            }
        })
    }

    /// 写回以 NUL 结尾的字符串
    pub fn string(self, value: &str) -> UrResult {
        let bytes = value.as_bytes();
        self.write(bytes.len() + 1, false, |out| {
            out[..bytes.len()].copy_from_slice(bytes);
            out[bytes.len()] = 0;
        })
    }

    /// 写回原始字节
    pub fn bytes(self, value: &[u8]) -> UrResult {
        self.write(value.len(), false, |out| out.copy_from_slice(value))
    }

    fn write(self, value_size: usize, zero_fill: bool, assign: impl FnOnce(&mut [u8])) -> UrResult {
        let ReturnHelper {
            capacity,
            value,
            size_ret,
        } = self;

        if let Some(buffer) = value {
            let capacity = capacity.min(buffer.len());
            ur_assert!(capacity >= value_size, UrError::InvalidValue);
            if zero_fill {
                buffer[..capacity].fill(0);
            }
            assign(&mut buffer[..value_size]);
        }

        if let Some(size_ret) = size_ret {
            *size_ret = value_size;
        }
        Ok(())
    }
}
