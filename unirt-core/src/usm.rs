//! 统一共享内存（USM）
//!
//! 描述符、内存建议、分配请求以及分配记录。参数校验集中在这里，
//! 入口点按固定顺序执行校验，校验失败时不会分配任何内存。

use bitflags::bitflags;
use crate::adapter::DeviceBackend;
use crate::device::Device;
use crate::info::InfoScalar;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use unirt_common::is_valid_alignment;
use unirt_error::{UrError, UrResult, ur_assert};

/// USM 指针，也用于表示调用者的主机地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct UsmPtr(usize);

impl UsmPtr {
    /// 空指针
    pub const NULL: Self = Self(0);

    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 偏移 `bytes` 字节，溢出时返回 `None`
    pub fn offset(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl InfoScalar for UsmPtr {
    const SIZE: usize = std::mem::size_of::<usize>();

    fn write_ne(self, out: &mut [u8]) {
        self.0.write_ne(out);
    }
}

bitflags! {
    /// 内存建议
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UsmAdviceFlags: u32 {
        const SET_READ_MOSTLY = 1 << 0;
        const CLEAR_READ_MOSTLY = 1 << 1;
        const SET_PREFERRED_LOCATION = 1 << 2;
        const CLEAR_PREFERRED_LOCATION = 1 << 3;
        const SET_NON_ATOMIC_MOSTLY = 1 << 4;
        const CLEAR_NON_ATOMIC_MOSTLY = 1 << 5;
        const BIAS_CACHED = 1 << 6;
        const BIAS_UNCACHED = 1 << 7;
    }
}

impl UsmAdviceFlags {
    /// 不能同时出现的建议组合
    const CONFLICTS: [(Self, Self); 4] = [
        (Self::SET_READ_MOSTLY, Self::CLEAR_READ_MOSTLY),
        (Self::SET_PREFERRED_LOCATION, Self::CLEAR_PREFERRED_LOCATION),
        (Self::SET_NON_ATOMIC_MOSTLY, Self::CLEAR_NON_ATOMIC_MOSTLY),
        (Self::BIAS_CACHED, Self::BIAS_UNCACHED),
    ];

    /// 校验建议组合：未知位返回 `InvalidEnumeration`，互相矛盾返回 `InvalidValue`
    pub fn validate(self) -> UrResult {
        ur_assert!(Self::all().contains(self), UrError::InvalidEnumeration);
        for (set, clear) in Self::CONFLICTS {
            ur_assert!(!self.contains(set | clear), UrError::InvalidValue);
        }
        Ok(())
    }
}

bitflags! {
    /// 通用分配提示
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UsmMemFlags: u32 {
        const WRITE_COMBINED = 1 << 27;
        const INITIAL_PLACEMENT_DEVICE = 1 << 28;
        const INITIAL_PLACEMENT_HOST = 1 << 29;
        const DEVICE_READ_ONLY = 1 << 30;
    }
}

bitflags! {
    /// 主机分配标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UsmHostMemFlags: u32 {
        const INITIAL_PLACEMENT = 1 << 0;
    }
}

bitflags! {
    /// 设备分配标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UsmDeviceMemFlags: u32 {
        const WRITE_COMBINED = 1 << 0;
        const INITIAL_PLACEMENT = 1 << 1;
        const DEVICE_READ_ONLY = 1 << 2;
    }
}

/// 主机端分配描述
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsmHostDesc {
    pub flags: UsmHostMemFlags,
}

/// 设备端分配描述
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsmDeviceDesc {
    pub flags: UsmDeviceMemFlags,
}

/// 分配描述符
///
/// `host`/`device` 子描述对应 C 接口中链接在 `pNext` 上的扩展结构。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsmDesc {
    pub hints: UsmMemFlags,
    pub advice: UsmAdviceFlags,
    /// 对齐要求，0 表示由后端决定，否则必须是 2 的幂
    pub align: u32,
    pub host: Option<UsmHostDesc>,
    pub device: Option<UsmDeviceDesc>,
}

impl UsmDesc {
    /// 按入口点顺序校验描述符（对齐、建议、标志）
    pub fn validate(&self) -> UrResult {
        ur_assert!(is_valid_alignment(self.align), UrError::InvalidValue);
        self.advice.validate()?;
        ur_assert!(UsmMemFlags::all().contains(self.hints), UrError::InvalidEnumeration);
        if let Some(host) = self.host {
            ur_assert!(UsmHostMemFlags::all().contains(host.flags), UrError::InvalidEnumeration);
        }
        if let Some(device) = self.device {
            ur_assert!(UsmDeviceMemFlags::all().contains(device.flags), UrError::InvalidEnumeration);
        }
        ur_assert!(
            !self.hints.contains(
                UsmMemFlags::INITIAL_PLACEMENT_DEVICE | UsmMemFlags::INITIAL_PLACEMENT_HOST
            ),
            UrError::InvalidValue
        );
        Ok(())
    }
}

/// 分配种类（入口点层面）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum UsmType {
    Unknown = 0,
    Host = 1,
    Device = 2,
    Shared = 3,
}

impl InfoScalar for UsmType {
    const SIZE: usize = std::mem::size_of::<u32>();

    fn write_ne(self, out: &mut [u8]) {
        (self as u32).write_ne(out);
    }
}

/// 分配的实际放置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsmPlacement {
    Host,
    Device,
    /// 只在一个设备与主机之间共享
    SharedSingleDevice,
    /// 在上下文内所有设备与主机之间共享
    SharedCrossDevice,
}

impl UsmPlacement {
    pub fn usm_type(self) -> UsmType {
        match self {
            UsmPlacement::Host => UsmType::Host,
            UsmPlacement::Device => UsmType::Device,
            UsmPlacement::SharedSingleDevice | UsmPlacement::SharedCrossDevice => UsmType::Shared,
        }
    }

    /// 是否绑定到单个设备
    pub fn is_device_bound(self) -> bool {
        matches!(self, UsmPlacement::Device | UsmPlacement::SharedSingleDevice)
    }
}

/// 交给后端的分配请求，已通过全部校验
#[derive(Clone, Copy)]
pub struct UsmAllocRequest<'a> {
    pub placement: UsmPlacement,
    /// 设备绑定的分配所在的设备
    pub device: Option<&'a Arc<dyn DeviceBackend>>,
    pub size: usize,
    /// 对齐要求，0 表示由后端决定
    pub align: usize,
    pub desc: &'a UsmDesc,
}

/// 上下文内的分配记录
#[derive(Debug, Clone)]
pub struct UsmAllocation {
    pub ptr: UsmPtr,
    pub size: usize,
    pub placement: UsmPlacement,
    pub device: Option<Device>,
    pub advice: UsmAdviceFlags,
}

impl UsmAllocation {
    /// `[ptr, ptr + len)` 是否完全落在此分配内
    pub fn contains_range(&self, ptr: UsmPtr, len: usize) -> bool {
        let start = self.ptr.addr();
        match (ptr.addr().checked_sub(start), ptr.addr().checked_add(len)) {
            (Some(_), Some(end)) => end <= start + self.size,
            _ => false,
        }
    }
}

/// USM 分配查询属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum UsmAllocInfo {
    Type = 0,
    BasePtr = 1,
    Size = 2,
    Device = 3,
}

/// 校验分配大小：0、超过设备上限或超过地址空间一半都返回 `InvalidUsmSize`
pub fn validate_usm_size(size: usize, limit: u64) -> UrResult {
    ur_assert!(size != 0, UrError::InvalidUsmSize);
    ur_assert!(size <= isize::MAX as usize, UrError::InvalidUsmSize);
    ur_assert!(size as u64 <= limit, UrError::InvalidUsmSize);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advice_conflicts() {
        let ok = UsmAdviceFlags::SET_READ_MOSTLY | UsmAdviceFlags::BIAS_CACHED;
        assert!(ok.validate().is_ok());

        let conflicting = UsmAdviceFlags::BIAS_CACHED | UsmAdviceFlags::BIAS_UNCACHED;
        assert_eq!(conflicting.validate(), Err(UrError::InvalidValue));

        let unknown = UsmAdviceFlags::from_bits_retain(1 << 20);
        assert_eq!(unknown.validate(), Err(UrError::InvalidEnumeration));
    }

    #[test]
    fn test_flag_scalar_writes_raw_bits() {
        let flags = UsmMemFlags::WRITE_COMBINED | UsmMemFlags::DEVICE_READ_ONLY;
        let mut out = [0u8; 4];
        InfoScalar::write_ne(flags, &mut out);
        assert_eq!(u32::from_ne_bytes(out), (1 << 27) | (1 << 30));
        assert_eq!(<UsmMemFlags as InfoScalar>::SIZE, 4);

        assert!(UsmMemFlags::default().is_empty());
        assert!(UsmMemFlags::all().contains(flags));
        assert!(!UsmMemFlags::all().contains(UsmMemFlags::from_bits_retain(1 << 3)));
        assert_eq!(UsmMemFlags::from_bits(1 << 3), None);
    }

    #[test]
    fn test_desc_alignment() {
        let mut desc = UsmDesc::default();
        assert!(desc.validate().is_ok());
        desc.align = 5;
        assert_eq!(desc.validate(), Err(UrError::InvalidValue));
        desc.align = 4096;
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_desc_sub_descriptor_flags() {
        let desc = UsmDesc {
            device: Some(UsmDeviceDesc {
                flags: UsmDeviceMemFlags::from_bits_retain(1 << 9),
            }),
            ..UsmDesc::default()
        };
        assert_eq!(desc.validate(), Err(UrError::InvalidEnumeration));

        let desc = UsmDesc {
            host: Some(UsmHostDesc {
                flags: UsmHostMemFlags::INITIAL_PLACEMENT,
            }),
            device: Some(UsmDeviceDesc {
                flags: UsmDeviceMemFlags::WRITE_COMBINED,
            }),
            ..UsmDesc::default()
        };
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(validate_usm_size(0, 1024), Err(UrError::InvalidUsmSize));
        assert_eq!(validate_usm_size(2048, 1024), Err(UrError::InvalidUsmSize));
        assert_eq!(
            validate_usm_size(usize::MAX, u64::MAX),
            Err(UrError::InvalidUsmSize)
        );
        assert!(validate_usm_size(1024, 1024).is_ok());
    }

    #[test]
    fn test_contains_range() {
        let alloc = UsmAllocation {
            ptr: UsmPtr::from_addr(0x1000),
            size: 0x100,
            placement: UsmPlacement::Host,
            device: None,
            advice: UsmAdviceFlags::empty(),
        };
        assert!(alloc.contains_range(UsmPtr::from_addr(0x1000), 0x100));
        assert!(alloc.contains_range(UsmPtr::from_addr(0x10f0), 0x10));
        assert!(!alloc.contains_range(UsmPtr::from_addr(0x10f0), 0x11));
        assert!(!alloc.contains_range(UsmPtr::from_addr(0xff0), 0x8));
    }
}
