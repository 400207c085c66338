//! Backend implementations
//!
//! This module contains:
//! - `host` - Host backend emulating devices in process memory (reference implementation)

pub mod host;

// Re-export backends
pub use host::{HostBackend, LaunchRecord, ReleaseRecord};
