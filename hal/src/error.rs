//! # Ember Error Handling
//!
//! One error type for the whole submission stack.
//!
//! Every fallible call returns [`Result`]. A failed call never leaves a
//! command list, event or fence half-updated: validation runs before any
//! state is touched.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Ember Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Ember unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation not valid for the object's current lifecycle state
    InvalidState,
    /// Event pool has no free slot left
    OutOfPoolCapacity,
    /// A wait exceeded its deadline
    Timeout,

    // =========================================================================
    // Capability Errors
    // =========================================================================
    /// Cross-device access attempted without peer-to-peer support
    PeerAccessDenied,
    /// Atomic or concurrent access requested without hardware support
    CapabilityUnsupported,
    /// Operation not supported by this object (e.g. a kernel on a copy engine)
    Unsupported,

    // =========================================================================
    // Parameter Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Device identifier does not name a device of this driver
    DeviceNotFound,
    /// Object not found
    NotFound,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Address is not inside any live allocation
    InvalidGpuAddress,
    /// Range runs past the end of its allocation
    OutOfBounds,
    /// Host access to memory only the device can see
    HostInaccessible,
    /// Out of memory
    OutOfMemory,

    // =========================================================================
    // IPC Errors
    // =========================================================================
    /// IPC token is malformed, revoked or of the wrong kind
    InvalidIpcHandle,

    // =========================================================================
    // Host Errors
    // =========================================================================
    /// Host resources (threads) could not be obtained
    OutOfResources,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Lifecycle
            Self::InvalidState => write!(f, "invalid state for operation"),
            Self::OutOfPoolCapacity => write!(f, "event pool exhausted"),
            Self::Timeout => write!(f, "operation timed out"),

            // Capability
            Self::PeerAccessDenied => write!(f, "peer access denied"),
            Self::CapabilityUnsupported => write!(f, "memory access capability unsupported"),
            Self::Unsupported => write!(f, "operation not supported"),

            // Parameter
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::DeviceNotFound => write!(f, "device not found"),
            Self::NotFound => write!(f, "object not found"),

            // Memory
            Self::InvalidGpuAddress => write!(f, "invalid GPU address"),
            Self::OutOfBounds => write!(f, "range out of allocation bounds"),
            Self::HostInaccessible => write!(f, "memory not accessible from host"),
            Self::OutOfMemory => write!(f, "out of memory"),

            // IPC
            Self::InvalidIpcHandle => write!(f, "invalid IPC handle"),

            // Host
            Self::OutOfResources => write!(f, "out of host resources"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::OutOfPoolCapacity)
    }

    /// Check if this error reports a missing platform capability
    pub fn is_capability_error(&self) -> bool {
        matches!(
            self,
            Self::PeerAccessDenied | Self::CapabilityUnsupported | Self::Unsupported
        )
    }
}
