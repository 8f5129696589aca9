//! Error taxonomy for a snapshot session.
//!
//! Every failure carries enough to produce an HRESULT-style status code, which is what
//! backup tooling driving this crate expects back.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::service::Phase;

pub type Result<T> = std::result::Result<T, ShadowError>;

pub const E_ABORT: i32 = 0x8000_4004_u32 as i32;
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
pub const E_NOTIMPL: i32 = 0x8000_4001_u32 as i32;
pub const E_PATH_NOT_FOUND: i32 = 0x8007_0003_u32 as i32;
pub const E_TIMEOUT: i32 = 0x8007_05B4_u32 as i32;
pub const VSS_E_PROVIDER_NOT_REGISTERED: i32 = 0x8004_2304_u32 as i32;

/// Wraps a Win32 error code the way `HRESULT_FROM_WIN32` does.
pub fn hresult_from_win32(code: u32) -> i32 {
    if code == 0 {
        E_FAIL
    } else if (code as i32) < 0 {
        code as i32
    } else {
        ((code & 0xFFFF) | 0x8007_0000) as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountDirection {
    Mount,
    Unmount,
}

impl fmt::Display for MountDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountDirection::Mount => f.write_str("mounting"),
            MountDirection::Unmount => f.write_str("removing"),
        }
    }
}

/// Why an awaited operation did not finish successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncFailure {
    /// The operation completed with this non-success status.
    Status(i32),
    /// The operation was still pending when the wait timeout expired.
    TimedOut(Duration),
}

impl fmt::Display for AsyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncFailure::Status(code) => write!(f, "status 0x{:08x}", *code as u32),
            AsyncFailure::TimedOut(after) => write!(f, "timed out after {:?}", after),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("Source path is not an existing directory: {}", path.display())]
    Validation { path: PathBuf },

    #[error("Unable to locate the system snapshot provider.")]
    ProviderNotFound,

    #[error("GatherWriterMetadata was cancelled.")]
    MetadataGatherCancelled,

    #[error("{phase} failed: {cause}")]
    AsyncOperationFailed { phase: Phase, cause: AsyncFailure },

    #[error("There was an error calling DefineDosDevice when {direction} device {device}. Error: {code}")]
    DeviceMount {
        direction: MountDirection,
        device: String,
        code: u32,
    },

    #[error("There was a COM failure 0x{:08x} in {call}", *code as u32)]
    PlatformCallFailed { call: &'static str, code: i32 },

    #[error("callback failed: {0}")]
    CallbackFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl ShadowError {
    pub fn platform(call: &'static str, code: i32) -> Self {
        ShadowError::PlatformCallFailed { call, code }
    }

    /// Status code reported to the caller for this failure.
    pub fn code(&self) -> i32 {
        match self {
            ShadowError::Validation { .. } => E_PATH_NOT_FOUND,
            ShadowError::ProviderNotFound => VSS_E_PROVIDER_NOT_REGISTERED,
            ShadowError::MetadataGatherCancelled => E_ABORT,
            ShadowError::AsyncOperationFailed { cause, .. } => match cause {
                AsyncFailure::Status(code) if *code < 0 => *code,
                AsyncFailure::Status(_) => E_FAIL,
                AsyncFailure::TimedOut(_) => E_TIMEOUT,
            },
            ShadowError::DeviceMount { code, .. } => hresult_from_win32(*code),
            ShadowError::PlatformCallFailed { code, .. } => *code,
            ShadowError::CallbackFailed(_) => E_FAIL,
            ShadowError::Unsupported(_) => E_NOTIMPL,
        }
    }
}

/// 0 on success, otherwise the originating failure's code.
pub fn status_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_code_is_carried_verbatim() {
        let err = ShadowError::platform("AddToSnapshotSet", 0x8004_230C_u32 as i32);
        assert_eq!(err.code(), 0x8004_230C_u32 as i32);
        assert!(err.to_string().contains("AddToSnapshotSet"));
    }

    #[test]
    fn test_timeout_is_distinct_from_failed_status() {
        let timed_out = ShadowError::AsyncOperationFailed {
            phase: Phase::PrepareForBackup,
            cause: AsyncFailure::TimedOut(Duration::from_secs(5)),
        };
        let failed = ShadowError::AsyncOperationFailed {
            phase: Phase::PrepareForBackup,
            cause: AsyncFailure::Status(0x8004_2318_u32 as i32),
        };
        assert_eq!(timed_out.code(), E_TIMEOUT);
        assert_eq!(failed.code(), 0x8004_2318_u32 as i32);
        assert!(timed_out.to_string().contains("PrepareForBackup"));
    }

    #[test]
    fn test_non_failure_status_maps_to_e_fail() {
        // VSS_S_ASYNC_CANCELLED is a success-class code
        let err = ShadowError::AsyncOperationFailed {
            phase: Phase::BackupComplete,
            cause: AsyncFailure::Status(0x0004_230B),
        };
        assert_eq!(err.code(), E_FAIL);
    }

    #[test]
    fn test_win32_codes_are_wrapped() {
        assert_eq!(hresult_from_win32(2), 0x8007_0002_u32 as i32);
        assert_eq!(hresult_from_win32(0), E_FAIL);
        let err = ShadowError::DeviceMount {
            direction: MountDirection::Mount,
            device: "Q:".into(),
            code: 5,
        };
        assert_eq!(err.code(), 0x8007_0005_u32 as i32);
    }

    #[test]
    fn test_status_code_success_is_zero() {
        assert_eq!(status_code(&Ok(())), 0);
        assert_eq!(status_code(&Err(ShadowError::ProviderNotFound)), VSS_E_PROVIDER_NOT_REGISTERED);
    }
}
