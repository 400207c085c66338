//! Kernel launch environment and the per-context launch buffer slot
//!
//! The launch buffer is read by the device while a launch transfer is in
//! flight, so the slot stays reserved from the launch until a synchronize
//! observes queue completion. Returning from the enqueueing call is not
//! enough.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::error::{OffloadError, Result};

/// Per-launch environment copied to the device alongside a kernel launch
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelLaunchEnvironment {
    pub reduction_cnt: u32,
    pub reduction_iter_cnt: u32,
    /// Device address of the reduction scratch buffer
    pub reduction_buffer: u64,
}

impl KernelLaunchEnvironment {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// One launch buffer slot
#[derive(Debug, Default)]
pub(crate) struct LaunchBuffer {
    bytes: Option<Arc<[u8]>>,
    in_flight: bool,
}

impl LaunchBuffer {
    /// Replace the buffer contents
    ///
    /// # Errors
    ///
    /// `LaunchBufferBusy` while a launch reading the current contents may
    /// still be in flight.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if self.in_flight {
            return Err(OffloadError::LaunchBufferBusy);
        }
        self.bytes = Some(Arc::from(bytes));
        Ok(())
    }

    /// Hand the contents to a launch and reserve the slot
    pub fn reserve(&mut self) -> Result<Arc<[u8]>> {
        if self.in_flight {
            return Err(OffloadError::LaunchBufferBusy);
        }
        let bytes = self
            .bytes
            .get_or_insert_with(|| Arc::from(KernelLaunchEnvironment::default().as_bytes()));
        self.in_flight = true;
        Ok(Arc::clone(bytes))
    }

    /// Free the slot once the transfer reading it is known complete, or
    /// when the launch was never enqueued
    pub fn retire(&mut self) {
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }
}
