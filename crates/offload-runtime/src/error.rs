//! Error types for offload runtime operations

use std::fmt;
use std::time::Duration;

use crate::backend::{AllocationHandle, DeviceHandle, QueueHandle};
use crate::context::ContextState;
use crate::runtime::RegistrationId;

/// Result type for offload runtime operations
pub type Result<T> = std::result::Result<T, OffloadError>;

/// Errors that can occur at the host/device registration boundary
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    /// Host entries and image entries do not correspond by name, kind or size
    #[error("malformed binary: {0}")]
    MalformedBinary(String),

    /// No device image targets the device's architecture
    #[error("no compatible image for architecture '{architecture}' (available: [{}])", available.join(", "))]
    NoCompatibleImage {
        architecture: String,
        available: Vec<String>,
    },

    /// More than one device image claims the same architecture tag
    #[error("duplicate device image for architecture '{architecture}'")]
    DuplicateImage { architecture: String },

    /// A required host symbol has no definition in the loaded image
    #[error("unresolved symbol '{name}' on {device}")]
    UnresolvedSymbol { name: String, device: DeviceHandle },

    /// The queue did not report completion before the timeout elapsed
    #[error("synchronize timed out after {waited:?}; context remains draining")]
    Timeout { waited: Duration },

    /// A launch was requested while the previous launch may still be reading the launch buffer
    #[error("launch buffer busy: previous launch not known to be complete")]
    LaunchBufferBusy,

    /// Unknown registration id
    #[error("invalid registration id: {0}")]
    InvalidRegistration(RegistrationId),

    /// The binary is not loaded on the device
    #[error("registration {id} is not loaded on {device}")]
    NotLoaded { id: RegistrationId, device: DeviceHandle },

    /// Unknown device handle
    #[error("invalid device handle: {0}")]
    InvalidDevice(DeviceHandle),

    /// Unknown queue handle
    #[error("invalid queue handle: {0}")]
    InvalidQueue(QueueHandle),

    /// Unknown or already released allocation handle
    #[error("invalid allocation handle: {0}")]
    InvalidAllocation(AllocationHandle),

    /// Allocation handle was attached to the context twice
    #[error("allocation {0} is already attached to this context")]
    AllocationAlreadyAttached(AllocationHandle),

    /// Allocation access out of bounds
    #[error("allocation access out of bounds: offset {offset} + size {size} > allocation size {allocation_size}")]
    AllocationOutOfBounds {
        offset: usize,
        size: usize,
        allocation_size: usize,
    },

    /// Operation attempted on a context that no longer accepts work
    #[error("async context no longer accepts operations (state: {state})")]
    ContextClosed { state: ContextState },

    /// Context must be finalized before it can be destroyed
    #[error("async context not finalized (state: {state})")]
    ContextNotFinalized { state: ContextState },

    /// An operation on the queue failed while draining
    #[error("queue {queue} failed: {message}")]
    QueueFailure { queue: QueueHandle, message: String },

    /// Raw boundary structure is null or ill-formed
    #[error("invalid ABI structure: {0}")]
    InvalidAbi(String),

    /// Runtime configuration could not be parsed
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    /// Backend-specific failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl OffloadError {
    /// Create a malformed binary error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedBinary(msg.into())
    }

    /// Create an invalid ABI error
    pub fn invalid_abi(msg: impl Into<String>) -> Self {
        Self::InvalidAbi(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl fmt::Display) -> Self {
        Self::Backend(msg.to_string())
    }

    /// Whether retrying the same call may succeed without fixing the caller or the binary.
    ///
    /// Only drain failures qualify: the context stays `Draining` and
    /// `synchronize` may be called again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::QueueFailure { .. })
    }
}
