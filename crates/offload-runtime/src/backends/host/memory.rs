//! Memory manager for the host backend
//!
//! Allocations live in host heap memory keyed by handle ID. Every release is
//! stamped with the backend's event clock so callers can check that memory
//! was only returned after the queue that used it completed.

use std::collections::HashMap;

use crate::backend::{AllocationHandle, DeviceHandle, QueueHandle};
use crate::error::{OffloadError, Result};

/// One release performed by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub device: DeviceHandle,
    pub allocation: AllocationHandle,
    /// Event clock value at release time
    pub sequence: u64,
}

struct HostAllocation {
    device: DeviceHandle,
    origin: Option<QueueHandle>,
    data: Vec<u8>,
}

/// Host-side storage for device allocations
pub(crate) struct MemoryManager {
    allocations: HashMap<u64, HostAllocation>,
    next_allocation_id: u64,
    release_log: Vec<ReleaseRecord>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            allocations: HashMap::new(),
            next_allocation_id: 1,
            release_log: Vec::new(),
        }
    }

    pub fn allocate(&mut self, device: DeviceHandle, origin: Option<QueueHandle>, size: usize) -> AllocationHandle {
        let id = self.next_allocation_id;
        self.next_allocation_id += 1;
        self.allocations.insert(
            id,
            HostAllocation {
                device,
                origin,
                data: vec![0; size],
            },
        );
        AllocationHandle::new(id)
    }

    pub fn release(&mut self, device: DeviceHandle, handle: AllocationHandle, sequence: u64) -> Result<()> {
        match self.allocations.get(&handle.id()) {
            Some(allocation) if allocation.device == device => {
                self.allocations.remove(&handle.id());
                self.release_log.push(ReleaseRecord {
                    device,
                    allocation: handle,
                    sequence,
                });
                Ok(())
            }
            _ => Err(OffloadError::InvalidAllocation(handle)),
        }
    }

    /// Validate that `[offset, offset + len)` lies inside the allocation
    pub fn check_range(&self, device: DeviceHandle, handle: AllocationHandle, offset: usize, len: usize) -> Result<()> {
        let allocation = self.get(device, handle)?;
        if offset.checked_add(len).map_or(true, |end| end > allocation.data.len()) {
            return Err(OffloadError::AllocationOutOfBounds {
                offset,
                size: len,
                allocation_size: allocation.data.len(),
            });
        }
        Ok(())
    }

    pub fn write(&mut self, device: DeviceHandle, handle: AllocationHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(device, handle, offset, data.len())?;
        let allocation = self
            .allocations
            .get_mut(&handle.id())
            .ok_or(OffloadError::InvalidAllocation(handle))?;
        allocation.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, device: DeviceHandle, handle: AllocationHandle) -> Result<Vec<u8>> {
        Ok(self.get(device, handle)?.data.clone())
    }

    pub fn origin(&self, handle: AllocationHandle) -> Option<QueueHandle> {
        self.allocations.get(&handle.id()).and_then(|allocation| allocation.origin)
    }

    pub fn live_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn release_log(&self) -> &[ReleaseRecord] {
        &self.release_log
    }

    fn get(&self, device: DeviceHandle, handle: AllocationHandle) -> Result<&HostAllocation> {
        self.allocations
            .get(&handle.id())
            .filter(|allocation| allocation.device == device)
            .ok_or(OffloadError::InvalidAllocation(handle))
    }
}
