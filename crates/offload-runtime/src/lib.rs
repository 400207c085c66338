//! Registration and async-context runtime for device offloading
//!
//! This crate provides:
//! - **Data Model**: Entry records, device images and binary descriptors
//! - **Loading**: Architecture selection and symbol resolution per device
//! - **Async Contexts**: Deferred release of stream-scoped allocations
//! - **Backend Trait**: Pluggable device collaborator interface
//! - **Host Backend**: Reference implementation running on the host
//! - **Raw ABI**: Fixed-layout records for the dynamic plugin boundary
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Host program / code generator            │
//! │              (BinaryDescriptor at module load)            │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ register / load / unload
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     OffloadRuntime                        │
//! │   select_image → Backend::load_image → resolve_entries    │
//! │                      AsyncContext                         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Backend trait
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//!   ┌─────────┐  ┌─────────┐  ┌─────────┐
//!   │  Host   │  │   GPU   │  │  Other  │
//!   │ Backend │  │ plugin  │  │ plugin  │
//!   └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use offload_runtime::{BinaryDescriptor, DeviceHandle, DeviceImage, EntryRecord, HostBackend, OffloadRuntime};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(HostBackend::new());
//! let device = DeviceHandle::new(0, 0);
//! backend.add_device(device, "arch-x");
//! let runtime = OffloadRuntime::new(backend);
//!
//! // Register the unit's images and host entries
//! let id = runtime.register(
//!     BinaryDescriptor::new()
//!         .with_image(DeviceImage::new(
//!             "arch-x",
//!             vec![0; 64],
//!             vec![EntryRecord::function("kernel1"), EntryRecord::global("gvar", 64)],
//!         ))
//!         .with_host_entry(EntryRecord::function("kernel1"))
//!         .with_host_entry(EntryRecord::global("gvar", 64)),
//! );
//!
//! // Load on first use and resolve symbols
//! let table = runtime.load(device, id)?;
//! let kernel = table.address_of("kernel1").unwrap();
//!
//! // Run a stream of work and release its memory once complete
//! let mut ctx = runtime.create_async_context(device)?;
//! let gvar_init = ctx.allocate(64)?;
//! ctx.copy_to_device(gvar_init, 0, &[0; 64])?;
//! ctx.launch(kernel, &[gvar_init.id()])?;
//! ctx.finalize()?;
//!
//! runtime.unload(device, id)?;
//! runtime.unregister(id)?;
//! # Ok(())
//! # }
//! ```

pub mod abi;
pub mod backend;
pub mod backends;
pub mod binary;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod launch;
pub mod resolve;
pub mod runtime;
pub mod select;
pub mod table;

// Re-export public API
pub use abi::{
    RawBinaryDescriptor, RawDeviceImage, RawDeviceInfo, RawImageInfo, RawOffloadEntry, RawTableStorage,
    RawTargetTable, ABI_VERSION,
};
pub use backend::{AllocationHandle, Backend, DeviceHandle, ImageKey, LoadedImage, QueueHandle, SyncStatus};
pub use backends::HostBackend;
pub use binary::{BinaryDescriptor, DeviceImage, ImageInfo};
pub use config::{ExecutionMode, RuntimeConfig};
pub use context::{AsyncContext, ContextState};
pub use entry::{DeviceAddress, EntryFlags, EntryKind, EntryRecord};
pub use error::{OffloadError, Result};
pub use launch::KernelLaunchEnvironment;
pub use resolve::{resolve_entries, ResolveOptions};
pub use runtime::{OffloadRuntime, RegistrationId};
pub use select::select_image;
pub use table::ResolvedTable;
