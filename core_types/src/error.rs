//! Kernel error taxonomy
//!
//! The user-facing error set is fixed and closed. Synchronous calls return
//! these directly; asynchronous operations deliver the numeric code in the
//! error field of their completion record. Internal subsystem errors must be
//! converted into this taxonomy before they cross the syscall boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors visible to userspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum KernelError {
    /// The handle does not name any descriptor in the universe.
    #[error("no descriptor for handle")]
    NoDescriptor,

    /// The handle names a descriptor of the wrong variant.
    #[error("descriptor has the wrong type")]
    BadDescriptor,

    /// Arguments failed validation (alignment, flags, shape).
    #[error("illegal arguments")]
    IllegalArgs,

    /// The local endpoint was closed while the operation was pending.
    #[error("endpoint closed locally")]
    ClosedLocally,

    /// The peer endpoint was closed.
    #[error("endpoint closed remotely")]
    ClosedRemotely,

    /// The supplied buffer cannot hold the result.
    #[error("buffer too small")]
    BufferTooSmall,
}

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Numeric code meaning success; completion records use it in their error
/// field.
pub const CODE_NONE: u32 = 0;

impl KernelError {
    /// Returns the stable numeric code for this error.
    pub fn code(&self) -> u32 {
        match self {
            KernelError::NoDescriptor => 1,
            KernelError::BadDescriptor => 2,
            KernelError::IllegalArgs => 3,
            KernelError::ClosedLocally => 4,
            KernelError::ClosedRemotely => 5,
            KernelError::BufferTooSmall => 6,
        }
    }

    /// Decodes a numeric code; `CODE_NONE` yields `None`.
    pub fn from_code(code: u32) -> Option<KernelError> {
        match code {
            0 => None,
            1 => Some(KernelError::NoDescriptor),
            2 => Some(KernelError::BadDescriptor),
            4 => Some(KernelError::ClosedLocally),
            5 => Some(KernelError::ClosedRemotely),
            6 => Some(KernelError::BufferTooSmall),
            _ => Some(KernelError::IllegalArgs),
        }
    }
}

/// Translates a result into the numeric code carried by completion records.
pub fn code_of(result: &KernelResult<()>) -> u32 {
    match result {
        Ok(()) => CODE_NONE,
        Err(err) => err.code(),
    }
}
