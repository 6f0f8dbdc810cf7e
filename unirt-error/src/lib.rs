//! Unified error handling for the UniRT runtime
//!
//! 所有入口点都返回显式的结果码，从不通过 panic 报告调用者输入错误。
//! `UrError` 的判别值就是对外稳定的数值结果码，成功对应 `0`。

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use thiserror::Error;

/// 扩展结果码区间的上界（不含）
pub const EXT_RESULT_END: u32 = 0x1000;

/// 成功结果码
pub const RESULT_SUCCESS: u32 = 0;

/// Unified error type for all runtime entry points
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum UrError {
    #[error("invalid operation")]
    InvalidOperation = 1,

    #[error("invalid queue")]
    InvalidQueue = 3,

    #[error("invalid value")]
    InvalidValue = 4,

    #[error("invalid context")]
    InvalidContext = 5,

    #[error("invalid platform")]
    InvalidPlatform = 6,

    #[error("invalid buffer size")]
    InvalidBufferSize = 10,

    #[error("invalid memory object")]
    InvalidMemObject = 11,

    #[error("invalid event")]
    InvalidEvent = 12,

    #[error("invalid event wait list")]
    InvalidEventWaitList = 13,

    #[error("invalid device")]
    InvalidDevice = 19,

    #[error("device lost")]
    DeviceLost = 20,

    #[error("out of host memory")]
    OutOfHostMemory = 39,

    #[error("out of resources")]
    OutOfResources = 40,

    #[error("invalid USM allocation size")]
    InvalidUsmSize = 46,

    #[error("runtime not initialized or already torn down")]
    Uninitialized = 51,

    #[error("unsupported feature")]
    UnsupportedFeature = 54,

    #[error("invalid enumeration")]
    InvalidEnumeration = 62,

    #[error("invalid size")]
    InvalidSize = 63,

    #[error("invalid null handle")]
    InvalidNullHandle = 64,

    #[error("invalid null pointer")]
    InvalidNullPointer = 65,

    /// 需要通过带外通道（[`last_error`]）查询适配器自定义错误
    #[error("adapter specific error")]
    AdapterSpecific = EXT_RESULT_END - 1,

    #[error("unknown error")]
    Unknown = 0x7fff_fffe,
}

/// Result alias used by every entry point; `UrResult` 等价于 C 接口的结果码
pub type UrResult<T = ()> = Result<T, UrError>;

impl UrError {
    /// 获取数值结果码
    pub fn code(self) -> u32 {
        self as u32
    }

    /// 由数值结果码还原错误；`0`（成功）和未知码返回 `None`
    pub fn from_code(code: u32) -> Option<Self> {
        let error = match code {
            1 => UrError::InvalidOperation,
            3 => UrError::InvalidQueue,
            4 => UrError::InvalidValue,
            5 => UrError::InvalidContext,
            6 => UrError::InvalidPlatform,
            10 => UrError::InvalidBufferSize,
            11 => UrError::InvalidMemObject,
            12 => UrError::InvalidEvent,
            13 => UrError::InvalidEventWaitList,
            19 => UrError::InvalidDevice,
            20 => UrError::DeviceLost,
            39 => UrError::OutOfHostMemory,
            40 => UrError::OutOfResources,
            46 => UrError::InvalidUsmSize,
            51 => UrError::Uninitialized,
            54 => UrError::UnsupportedFeature,
            62 => UrError::InvalidEnumeration,
            63 => UrError::InvalidSize,
            64 => UrError::InvalidNullHandle,
            65 => UrError::InvalidNullPointer,
            c if c == EXT_RESULT_END - 1 => UrError::AdapterSpecific,
            0x7fff_fffe => UrError::Unknown,
            _ => return None,
        };
        Some(error)
    }

    /// 是否为调用者输入校验类错误（可恢复，且不会修改任何状态）
    pub fn is_validation_error(self) -> bool {
        matches!(
            self,
            UrError::InvalidNullHandle
                | UrError::InvalidNullPointer
                | UrError::InvalidValue
                | UrError::InvalidSize
                | UrError::InvalidUsmSize
                | UrError::InvalidBufferSize
                | UrError::InvalidEnumeration
                | UrError::InvalidEventWaitList
        )
    }
}

/// 将 `UrResult` 转换为 C 风格的数值结果码
pub fn result_code<T>(result: &UrResult<T>) -> u32 {
    match result {
        Ok(_) => RESULT_SUCCESS,
        Err(e) => e.code(),
    }
}

/// 单行校验辅助宏：条件不成立时提前返回给定错误
///
/// # Example
///
/// ```rust
/// use unirt_error::{ur_assert, UrError, UrResult};
///
/// fn check(align: u32) -> UrResult {
///     ur_assert!(align == 0 || align.is_power_of_two(), UrError::InvalidValue);
///     Ok(())
/// }
///
/// assert_eq!(check(5), Err(UrError::InvalidValue));
/// assert!(check(64).is_ok());
/// ```
#[macro_export]
macro_rules! ur_assert {
    ($condition:expr, $error:expr) => {
        if !($condition) {
            return Err($error);
        }
    };
}

/// 以灾难性错误终止进程
///
/// 仅用于内部不变量被破坏的情况（例如注册表状态损坏），
/// 调用者输入错误必须返回结果码而不是调用此函数。
#[cold]
pub fn die(message: &str) -> ! {
    tracing::error!(target: "unirt::die", "{}", message);
    eprintln!("die: {message}");
    std::process::abort()
}

// ============================================================================
// 适配器自定义错误通道
// ============================================================================

/// 适配器通过带外通道报告的最近一次错误
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterError {
    /// 错误描述
    pub message: String,
    /// 适配器自定义错误码
    pub code: i32,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<AdapterError>> = const { RefCell::new(None) };
}

/// 记录当前线程的适配器错误，并返回应交给调用者的 `AdapterSpecific`
pub fn set_last_error(message: impl Into<String>, code: i32) -> UrError {
    let error = AdapterError {
        message: message.into(),
        code,
    };
    tracing::debug!("adapter specific error {}: {}", error.code, error.message);
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(error));
    UrError::AdapterSpecific
}

/// 获取当前线程最近一次适配器错误
pub fn last_error() -> Option<AdapterError> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// 清除当前线程的适配器错误
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}
