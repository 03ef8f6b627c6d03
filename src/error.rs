//! Error Module
//!
//! Error taxonomy shared by every device operation.

use thiserror::Error;

use crate::kernel::KernelError;

pub type DxResult<T> = Result<T, DxError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DxError {
    /// Kernel allocation or shader arena exhaustion.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Malformed descriptors or out-of-range parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested data is not ready yet. Never recorded as a device error.
    #[error("data is not ready, still drawing")]
    StillDrawing,

    /// A kernel callback failed; the device should be considered lost.
    #[error("kernel callback {call} failed: {source}")]
    Fatal {
        call: &'static str,
        #[source]
        source: KernelError,
    },
}

impl DxError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DxError::InvalidArgument(message.into())
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        DxError::OutOfMemory(message.into())
    }

    /// The caller broke an API contract. Asserts in debug builds.
    #[track_caller]
    pub fn contract(message: impl Into<String>) -> Self {
        let message = message.into();
        debug_assert!(false, "contract violation: {message}");
        DxError::InvalidArgument(message)
    }

    /// Map a kernel failure from `call`. Only `allocate` reports memory
    /// pressure as a recoverable out-of-memory condition.
    pub fn kernel(call: &'static str, source: KernelError) -> Self {
        match source {
            KernelError::OutOfMemory if call == "allocate" => {
                DxError::OutOfMemory("kernel allocation failed".to_string())
            }
            KernelError::WasStillDrawing => DxError::StillDrawing,
            source => DxError::Fatal { call, source },
        }
    }

    /// Whether the error belongs in the device's last-error slot.
    pub fn is_device_error(&self) -> bool {
        !matches!(self, DxError::StillDrawing)
    }
}
