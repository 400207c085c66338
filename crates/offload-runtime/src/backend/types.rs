//! Handles and result types exchanged with backends

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::EntryRecord;

/// Capability token identifying where operations execute
///
/// A device handle never owns memory. Both fields are opaque values resolved
/// by the backend's own registry; two handles with equal fields refer to the
/// same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub context: u64,
    pub device: u64,
}

impl DeviceHandle {
    /// Create a new device handle
    pub const fn new(context: u64, device: u64) -> Self {
        Self { context, device }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}:dev{}", self.context, self.device)
    }
}

/// Handle to an ordered operation stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueHandle(pub u64);

impl QueueHandle {
    /// Create a new queue handle
    pub const fn new(id: u64) -> Self {
        QueueHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue{}", self.0)
    }
}

/// Handle to a device-side allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationHandle(pub u64);

impl AllocationHandle {
    /// Create a new allocation handle
    pub const fn new(id: u64) -> Self {
        AllocationHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AllocationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc{}", self.0)
    }
}

/// Backend-assigned identity of an image loaded on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageKey(pub u64);

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image{}", self.0)
    }
}

/// Result of loading one image on one device
///
/// `entries` is the image's entry table with device addresses filled in.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub key: ImageKey,
    pub entries: Vec<EntryRecord>,
}

/// Outcome of waiting on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every enqueued operation has completed
    Complete,
    /// The timeout elapsed with operations still in flight
    TimedOut,
}
