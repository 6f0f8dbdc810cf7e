//! 工具函数
//!
//! 主要提供 `UrCast`：在数值类型之间转换，并在调试构建中断言没有丢失信息。

/// 带检查的数值转换
///
/// 同宽度类型之间按位重新解释；窄化转换在调试构建中断言数值可以无损还原。
pub trait UrCast<To> {
    /// 执行转换
    fn ur_cast(self) -> To;
}

macro_rules! impl_ur_cast {
    ($($from:ty => [$($to:ty),*]);* $(;)?) => {
        $($(
            impl UrCast<$to> for $from {
                #[inline]
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                fn ur_cast(self) -> $to {
                    let value = self as $to;
                    debug_assert!(
                        value as $from == self,
                        "ur_cast from {} to {} lost information",
                        stringify!($from),
                        stringify!($to)
                    );
                    value
                }
            }
        )*)*
    };
}

impl_ur_cast! {
    u8 => [u8, u16, u32, u64, usize];
    u16 => [u8, u16, u32, u64, usize];
    u32 => [u8, u16, u32, u64, usize, i32, i64];
    u64 => [u8, u16, u32, u64, usize, i64];
    usize => [u8, u16, u32, u64, usize];
    i32 => [u32, i32, i64];
    i64 => [u32, u64, i32, i64];
}

/// 将 `value` 向上对齐到 `align`（必须是 2 的幂）
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// 对齐参数是否合法：`0` 表示不指定，否则必须是 2 的幂
#[inline]
pub fn is_valid_alignment(align: u32) -> bool {
    align == 0 || align.is_power_of_two()
}
