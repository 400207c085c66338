//! Backend trait and handle types for device collaborators

mod traits;
mod types;

pub use traits::Backend;
pub use types::{AllocationHandle, DeviceHandle, ImageKey, LoadedImage, QueueHandle, SyncStatus};
