//! Backend trait for device collaborators
//!
//! This trait is the seam between the runtime core and the device-specific
//! plugin that actually loads code, owns queues and services allocations.
//! The runtime never dereferences any handle it receives through it.

use std::sync::Arc;
use std::time::Duration;

use super::types::{AllocationHandle, DeviceHandle, ImageKey, LoadedImage, QueueHandle, SyncStatus};
use crate::binary::DeviceImage;
use crate::entry::DeviceAddress;
use crate::error::Result;

/// Device backend collaborator
///
/// # Architecture
///
/// ```text
/// ┌─────────────────────────────────────────────────────────┐
/// │                    OffloadRuntime                        │
/// │   registration · image selection · symbol resolution     │
/// │                    AsyncContext                          │
/// └─────────────────────┬───────────────────────────────────┘
///                       │ Backend trait
///         ┌─────────────┼─────────────┐
///         ▼             ▼             ▼
///   ┌─────────┐  ┌─────────┐  ┌─────────┐
///   │  Host   │  │   GPU   │  │  Other  │
///   │ Backend │  │ plugin  │  │ plugin  │
///   └─────────┘  └─────────┘  └─────────┘
/// ```
///
/// # Queue Model
///
/// Operations enqueued on a queue execute in FIFO order and complete
/// independently of the enqueueing call. A `None` queue means the operation
/// runs synchronously and has completed when the call returns.
///
/// Backends are shared across threads and use interior mutability; they are
/// responsible for serializing load and unload per device.
pub trait Backend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    // ============================================================================================
    // Devices and Images
    // ============================================================================================

    /// Check whether the backend knows this device
    fn is_valid_device(&self, device: DeviceHandle) -> bool;

    /// Architecture tag reported by the device
    ///
    /// # Errors
    ///
    /// Returns `InvalidDevice` if the device handle is unknown.
    fn architecture(&self, device: DeviceHandle) -> Result<String>;

    /// Load one image onto a device
    ///
    /// Returns the image's entry table with device addresses filled in.
    fn load_image(&self, device: DeviceHandle, image: &DeviceImage) -> Result<LoadedImage>;

    /// Unload a previously loaded image
    fn unload_image(&self, device: DeviceHandle, image: ImageKey) -> Result<()>;

    // ============================================================================================
    // Queues
    // ============================================================================================

    /// Create an ordered operation queue on a device
    fn create_queue(&self, device: DeviceHandle) -> Result<QueueHandle>;

    /// Destroy a queue; callers synchronize it first
    fn destroy_queue(&self, queue: QueueHandle) -> Result<()>;

    /// Block until every operation on `queue` completes or `timeout` elapses
    ///
    /// # Errors
    ///
    /// Returns `QueueFailure` if an enqueued operation failed. The queue can
    /// be synchronized again afterwards.
    fn synchronize(&self, queue: QueueHandle, timeout: Option<Duration>) -> Result<SyncStatus>;

    // ============================================================================================
    // Memory and Execution
    // ============================================================================================

    /// Allocate `size` bytes of device memory as an operation on `queue`
    fn allocate(&self, device: DeviceHandle, queue: Option<QueueHandle>, size: usize) -> Result<AllocationHandle>;

    /// Release an allocation
    ///
    /// # Errors
    ///
    /// Returns `InvalidAllocation` if the handle is unknown or already released.
    fn release(&self, device: DeviceHandle, allocation: AllocationHandle) -> Result<()>;

    /// Copy host bytes into an allocation
    ///
    /// The backend copies `data` before returning, so the caller's slice may
    /// be reused immediately.
    fn copy_to_device(
        &self,
        device: DeviceHandle,
        queue: Option<QueueHandle>,
        dst: AllocationHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<()>;

    /// Launch the kernel at `kernel`
    ///
    /// `launch_buffer` is read by the device asynchronously. The caller keeps
    /// it reserved until the queue reports completion.
    fn launch_kernel(
        &self,
        device: DeviceHandle,
        queue: Option<QueueHandle>,
        kernel: DeviceAddress,
        launch_buffer: Arc<[u8]>,
        args: &[u64],
    ) -> Result<()>;

    /// Downcast backend to &dyn Any for type-specific access
    fn as_any(&self) -> &dyn std::any::Any;
}
