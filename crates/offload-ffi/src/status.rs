//! Status codes returned across the C boundary

use offload_runtime::OffloadError;

/// Result of every `offload_*` call; `Success` is zero
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffloadStatus {
    Success = 0,
    MalformedBinary = 1,
    NoCompatibleImage = 2,
    DuplicateImage = 3,
    UnresolvedSymbol = 4,
    Timeout = 5,
    LaunchBufferBusy = 6,
    /// Unknown registration, device, queue, allocation or context handle
    InvalidHandle = 7,
    NotLoaded = 8,
    ContextClosed = 9,
    ContextNotFinalized = 10,
    QueueFailure = 11,
    /// Null or ill-formed argument
    InvalidArgument = 12,
    /// No runtime installed yet
    NotInitialized = 13,
    BackendError = 14,
}

impl OffloadStatus {
    pub fn is_success(self) -> bool {
        self == OffloadStatus::Success
    }
}

impl From<&OffloadError> for OffloadStatus {
    fn from(error: &OffloadError) -> Self {
        match error {
            OffloadError::MalformedBinary(_) => OffloadStatus::MalformedBinary,
            OffloadError::NoCompatibleImage { .. } => OffloadStatus::NoCompatibleImage,
            OffloadError::DuplicateImage { .. } => OffloadStatus::DuplicateImage,
            OffloadError::UnresolvedSymbol { .. } => OffloadStatus::UnresolvedSymbol,
            OffloadError::Timeout { .. } => OffloadStatus::Timeout,
            OffloadError::LaunchBufferBusy => OffloadStatus::LaunchBufferBusy,
            OffloadError::InvalidRegistration(_)
            | OffloadError::InvalidDevice(_)
            | OffloadError::InvalidQueue(_)
            | OffloadError::InvalidAllocation(_)
            | OffloadError::AllocationAlreadyAttached(_) => OffloadStatus::InvalidHandle,
            OffloadError::NotLoaded { .. } => OffloadStatus::NotLoaded,
            OffloadError::ContextClosed { .. } => OffloadStatus::ContextClosed,
            OffloadError::ContextNotFinalized { .. } => OffloadStatus::ContextNotFinalized,
            OffloadError::QueueFailure { .. } => OffloadStatus::QueueFailure,
            OffloadError::InvalidAbi(_)
            | OffloadError::InvalidConfig(_)
            | OffloadError::AllocationOutOfBounds { .. } => OffloadStatus::InvalidArgument,
            OffloadError::Backend(_) => OffloadStatus::BackendError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_runtime::DeviceHandle;

    #[test]
    fn test_status_values_are_stable() {
        assert_eq!(OffloadStatus::Success as i32, 0);
        assert_eq!(OffloadStatus::Timeout as i32, 5);
        assert_eq!(OffloadStatus::BackendError as i32, 14);
    }

    #[test]
    fn test_error_mapping() {
        let err = OffloadError::UnresolvedSymbol {
            name: "k".into(),
            device: DeviceHandle::new(0, 0),
        };
        assert_eq!(OffloadStatus::from(&err), OffloadStatus::UnresolvedSymbol);
        assert_eq!(
            OffloadStatus::from(&OffloadError::InvalidDevice(DeviceHandle::new(1, 1))),
            OffloadStatus::InvalidHandle
        );
        assert!(!OffloadStatus::from(&OffloadError::LaunchBufferBusy).is_success());
    }
}
