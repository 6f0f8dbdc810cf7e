//! 位标志类型的公共实现
//!
//! 标志类型本身由 `bitflags` 生成；这里为它们补上默认值（空集）和
//! 查询协议所需的 [`InfoScalar`](crate::info::InfoScalar)，按原始 `u32` 位写回。

macro_rules! flag_scalars {
    ($($name:ty),* $(,)?) => {
        $(
            impl Default for $name {
                fn default() -> Self {
                    Self::empty()
                }
            }

            impl $crate::info::InfoScalar for $name {
                const SIZE: usize = std::mem::size_of::<u32>();

                fn write_ne(self, out: &mut [u8]) {
                    $crate::info::InfoScalar::write_ne(self.bits(), out);
                }
            }
        )*
    };
}

flag_scalars!(
    crate::device::UsmCapabilities,
    crate::usm::UsmAdviceFlags,
    crate::usm::UsmMemFlags,
    crate::usm::UsmHostMemFlags,
    crate::usm::UsmDeviceMemFlags,
    crate::queue::QueueFlags,
    crate::memory::MemFlags,
);
