//! Host backend implementation
//!
//! Reference implementation of the [`Backend`] trait that emulates devices
//! in host memory. Each registered device reports an architecture tag,
//! images are "loaded" by assigning addresses from a per-device bump pointer,
//! and queues are FIFO worker threads.
//!
//! # Architecture
//!
//! ```text
//! HostBackend
//! ├── devices     - architecture tag + loaded images + address bump pointer
//! ├── queues      - HostQueue worker threads (FIFO)
//! ├── memory      - MemoryManager (allocations + release log)
//! ├── gate        - pause switch holding queued work in flight
//! └── clock       - event counter stamping completions and releases
//! ```
//!
//! # Usage
//!
//! ```rust
//! use offload_runtime::{Backend, DeviceHandle, HostBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = HostBackend::new();
//! let device = DeviceHandle::new(0, 0);
//! backend.add_device(device, "arch-x");
//!
//! let queue = backend.create_queue(device)?;
//! let buffer = backend.allocate(device, Some(queue), 64)?;
//! backend.copy_to_device(device, Some(queue), buffer, 0, &[1, 2, 3, 4])?;
//! backend.synchronize(queue, None)?;
//!
//! backend.release(device, buffer)?;
//! backend.destroy_queue(queue)?;
//! # Ok(())
//! # }
//! ```

mod memory;
mod queue;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::backend::{AllocationHandle, Backend, DeviceHandle, ImageKey, LoadedImage, QueueHandle, SyncStatus};
use crate::binary::DeviceImage;
use crate::entry::{DeviceAddress, EntryKind, EntryRecord};
use crate::error::{OffloadError, Result};
pub use memory::ReleaseRecord;
use memory::MemoryManager;
use queue::{HostQueue, QueueGate};

/// First address handed out on every host device
const DEVICE_ADDRESS_BASE: u64 = 0x1000;

/// Alignment of every symbol placed on a host device
const SYMBOL_ALIGNMENT: u64 = 16;

/// One kernel launch observed by the host backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub device: DeviceHandle,
    pub kernel: DeviceAddress,
    pub args: Vec<u64>,
    /// Launch buffer contents as read by the emulated transfer
    pub launch_buffer: Vec<u8>,
}

struct HostDevice {
    architecture: String,
    next_address: u64,
    images: HashMap<ImageKey, Vec<EntryRecord>>,
    kernels: HashSet<DeviceAddress>,
}

impl HostDevice {
    fn new(architecture: String) -> Self {
        Self {
            architecture,
            next_address: DEVICE_ADDRESS_BASE,
            images: HashMap::new(),
            kernels: HashSet::new(),
        }
    }

    /// Bump-allocate `size` bytes starting at `cursor`
    fn place(cursor: &mut u64, size: u64) -> Result<DeviceAddress> {
        let address = DeviceAddress::new(*cursor);
        *cursor = size
            .max(1)
            .div_ceil(SYMBOL_ALIGNMENT)
            .checked_mul(SYMBOL_ALIGNMENT)
            .and_then(|footprint| cursor.checked_add(footprint))
            .ok_or_else(|| OffloadError::backend("device address space exhausted"))?;
        Ok(address)
    }
}

/// Host backend emulating offload devices in process memory
pub struct HostBackend {
    devices: RwLock<HashMap<DeviceHandle, HostDevice>>,
    queues: RwLock<HashMap<QueueHandle, Arc<HostQueue>>>,
    memory: Arc<Mutex<MemoryManager>>,
    gate: Arc<QueueGate>,
    clock: Arc<AtomicU64>,
    launches: Arc<Mutex<Vec<LaunchRecord>>>,
    next_queue_id: AtomicU64,
    next_image_key: AtomicU64,
}

impl HostBackend {
    /// Create a host backend with no devices
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            memory: Arc::new(Mutex::new(MemoryManager::new())),
            gate: Arc::new(QueueGate::new()),
            clock: Arc::new(AtomicU64::new(0)),
            launches: Arc::new(Mutex::new(Vec::new())),
            next_queue_id: AtomicU64::new(1),
            next_image_key: AtomicU64::new(1),
        }
    }

    /// Register a device reporting `architecture`; re-adding replaces the device
    pub fn add_device(&self, device: DeviceHandle, architecture: impl Into<String>) {
        let architecture = architecture.into();
        tracing::debug!(%device, %architecture, "host device added");
        self.devices.write().insert(device, HostDevice::new(architecture));
    }

    /// Hold every queue's next operation until [`resume_queues`](Self::resume_queues)
    pub fn pause_queues(&self) {
        self.gate.set_paused(true);
    }

    /// Let queued operations run again
    pub fn resume_queues(&self) {
        self.gate.set_paused(false);
    }

    /// Make the next synchronize on `queue` report a failure
    pub fn inject_queue_failure(&self, queue: QueueHandle, message: impl Into<String>) -> Result<()> {
        self.queue(queue)?.inject_failure(message.into());
        Ok(())
    }

    /// Number of operations on `queue` that have not completed
    pub fn pending_operations(&self, queue: QueueHandle) -> Result<u64> {
        Ok(self.queue(queue)?.pending())
    }

    /// Every release performed so far, in release order
    pub fn release_log(&self) -> Vec<ReleaseRecord> {
        self.memory.lock().release_log().to_vec()
    }

    /// Event clock value of the most recent completion on `queue`
    ///
    /// Comparable with [`ReleaseRecord::sequence`]; zero if nothing completed.
    pub fn queue_last_completion(&self, queue: QueueHandle) -> Result<u64> {
        Ok(self.queue(queue)?.last_completion())
    }

    /// Every kernel launch that has executed
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().clone()
    }

    /// Number of allocations not yet released
    pub fn live_allocations(&self) -> usize {
        self.memory.lock().live_count()
    }

    /// Read back the contents of an allocation
    pub fn read_allocation(&self, device: DeviceHandle, allocation: AllocationHandle) -> Result<Vec<u8>> {
        self.memory.lock().read(device, allocation)
    }

    /// Queue that produced an allocation, if any
    pub fn allocation_origin(&self, allocation: AllocationHandle) -> Option<QueueHandle> {
        self.memory.lock().origin(allocation)
    }

    /// Number of images currently loaded on a device
    pub fn loaded_image_count(&self, device: DeviceHandle) -> usize {
        self.devices.read().get(&device).map_or(0, |d| d.images.len())
    }

    fn queue(&self, queue: QueueHandle) -> Result<Arc<HostQueue>> {
        self.queues
            .read()
            .get(&queue)
            .cloned()
            .ok_or(OffloadError::InvalidQueue(queue))
    }

    /// Resolve an optional queue and check it belongs to `device`
    fn device_queue(&self, device: DeviceHandle, queue: Option<QueueHandle>) -> Result<Option<Arc<HostQueue>>> {
        if !self.is_valid_device(device) {
            return Err(OffloadError::InvalidDevice(device));
        }
        match queue {
            Some(handle) => {
                let q = self.queue(handle)?;
                if q.device() != device {
                    return Err(OffloadError::InvalidQueue(handle));
                }
                Ok(Some(q))
            }
            None => Ok(None),
        }
    }

    /// Run `task` on `queue`, or inline when there is no queue
    fn run(&self, queue: Option<Arc<HostQueue>>, task: queue::QueueTask) -> Result<()> {
        match queue {
            Some(q) => q.submit(task),
            None => task().map_err(OffloadError::Backend),
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn is_valid_device(&self, device: DeviceHandle) -> bool {
        self.devices.read().contains_key(&device)
    }

    fn architecture(&self, device: DeviceHandle) -> Result<String> {
        self.devices
            .read()
            .get(&device)
            .map(|d| d.architecture.clone())
            .ok_or(OffloadError::InvalidDevice(device))
    }

    fn load_image(&self, device: DeviceHandle, image: &DeviceImage) -> Result<LoadedImage> {
        let mut devices = self.devices.write();
        let host_device = devices.get_mut(&device).ok_or(OffloadError::InvalidDevice(device))?;

        if host_device.architecture != image.architecture() {
            return Err(OffloadError::backend(format!(
                "image for '{}' cannot run on {device} ('{}')",
                image.architecture(),
                host_device.architecture
            )));
        }

        // Nothing is committed to the device until every symbol fits
        let mut cursor = host_device.next_address;
        let entries = image
            .entries
            .iter()
            .map(|entry| Ok(entry.clone().with_address(HostDevice::place(&mut cursor, entry.size)?)))
            .collect::<Result<Vec<EntryRecord>>>()?;

        host_device.next_address = cursor;
        host_device.kernels.extend(
            entries
                .iter()
                .filter(|entry| entry.kind() == EntryKind::Function)
                .map(|entry| entry.address),
        );

        let key = ImageKey(self.next_image_key.fetch_add(1, Ordering::SeqCst));
        host_device.images.insert(key, entries.clone());
        tracing::debug!(%device, image = %key, symbols = entries.len(), code_bytes = image.code().len(), "image loaded");

        Ok(LoadedImage { key, entries })
    }

    fn unload_image(&self, device: DeviceHandle, image: ImageKey) -> Result<()> {
        let mut devices = self.devices.write();
        let host_device = devices.get_mut(&device).ok_or(OffloadError::InvalidDevice(device))?;
        let entries = host_device
            .images
            .remove(&image)
            .ok_or_else(|| OffloadError::backend(format!("{image} is not loaded on {device}")))?;

        for entry in entries.iter().filter(|e| e.kind() == EntryKind::Function) {
            host_device.kernels.remove(&entry.address);
        }
        tracing::debug!(%device, %image, "image unloaded");
        Ok(())
    }

    fn create_queue(&self, device: DeviceHandle) -> Result<QueueHandle> {
        if !self.is_valid_device(device) {
            return Err(OffloadError::InvalidDevice(device));
        }
        let handle = QueueHandle::new(self.next_queue_id.fetch_add(1, Ordering::SeqCst));
        let q = HostQueue::spawn(handle, device, Arc::clone(&self.gate), Arc::clone(&self.clock))?;
        self.queues.write().insert(handle, Arc::new(q));
        Ok(handle)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> Result<()> {
        let q = self.queues.write().remove(&queue).ok_or(OffloadError::InvalidQueue(queue))?;
        q.shutdown();
        Ok(())
    }

    fn synchronize(&self, queue: QueueHandle, timeout: Option<Duration>) -> Result<SyncStatus> {
        self.queue(queue)?.synchronize(timeout)
    }

    fn allocate(&self, device: DeviceHandle, queue: Option<QueueHandle>, size: usize) -> Result<AllocationHandle> {
        self.device_queue(device, queue)?;
        Ok(self.memory.lock().allocate(device, queue, size))
    }

    fn release(&self, device: DeviceHandle, allocation: AllocationHandle) -> Result<()> {
        let sequence = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.memory.lock().release(device, allocation, sequence)
    }

    fn copy_to_device(
        &self,
        device: DeviceHandle,
        queue: Option<QueueHandle>,
        dst: AllocationHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let q = self.device_queue(device, queue)?;
        self.memory.lock().check_range(device, dst, offset, data.len())?;

        let memory = Arc::clone(&self.memory);
        let bytes = data.to_vec();
        self.run(
            q,
            Box::new(move || {
                memory
                    .lock()
                    .write(device, dst, offset, &bytes)
                    .map_err(|e| e.to_string())
            }),
        )
    }

    fn launch_kernel(
        &self,
        device: DeviceHandle,
        queue: Option<QueueHandle>,
        kernel: DeviceAddress,
        launch_buffer: Arc<[u8]>,
        args: &[u64],
    ) -> Result<()> {
        let q = self.device_queue(device, queue)?;
        let known = self.devices.read().get(&device).is_some_and(|d| d.kernels.contains(&kernel));
        if !known {
            return Err(OffloadError::backend(format!("no kernel loaded at {kernel} on {device}")));
        }

        let launches = Arc::clone(&self.launches);
        let args = args.to_vec();
        self.run(
            q,
            Box::new(move || {
                launches.lock().push(LaunchRecord {
                    device,
                    kernel,
                    args,
                    launch_buffer: launch_buffer.to_vec(),
                });
                Ok(())
            }),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: DeviceHandle = DeviceHandle::new(0, 0);

    fn backend() -> HostBackend {
        let backend = HostBackend::new();
        backend.add_device(DEV, "arch-x");
        backend
    }

    fn image() -> DeviceImage {
        DeviceImage::new(
            "arch-x",
            vec![0; 32],
            vec![EntryRecord::function("kernel1"), EntryRecord::global("gvar", 64)],
        )
    }

    #[test]
    fn test_load_assigns_distinct_non_null_addresses() {
        let backend = backend();
        let loaded = backend.load_image(DEV, &image()).unwrap();

        assert_eq!(loaded.entries.len(), 2);
        assert!(loaded.entries.iter().all(|e| !e.address.is_null()));
        assert_ne!(loaded.entries[0].address, loaded.entries[1].address);
        assert_eq!(loaded.entries[1].address.raw() % SYMBOL_ALIGNMENT, 0);
        assert_eq!(backend.loaded_image_count(DEV), 1);

        backend.unload_image(DEV, loaded.key).unwrap();
        assert_eq!(backend.loaded_image_count(DEV), 0);
        assert!(backend.unload_image(DEV, loaded.key).is_err());
    }

    #[test]
    fn test_oversized_global_exhausts_address_space() {
        let backend = backend();
        let huge = DeviceImage::new(
            "arch-x",
            vec![],
            vec![EntryRecord::function("kernel1"), EntryRecord::global("g", u64::MAX - 4)],
        );

        assert!(matches!(backend.load_image(DEV, &huge), Err(OffloadError::Backend(_))));
        assert_eq!(backend.loaded_image_count(DEV), 0);

        // The failed load left the device's address space untouched
        let loaded = backend.load_image(DEV, &image()).unwrap();
        assert_eq!(loaded.entries[0].address.raw(), DEVICE_ADDRESS_BASE);
    }

    #[test]
    fn test_load_rejects_foreign_architecture() {
        let backend = backend();
        let foreign = DeviceImage::new("arch-y", vec![], vec![]);
        assert!(matches!(backend.load_image(DEV, &foreign), Err(OffloadError::Backend(_))));
    }

    #[test]
    fn test_unknown_device() {
        let backend = backend();
        let other = DeviceHandle::new(0, 9);
        assert!(!backend.is_valid_device(other));
        assert!(matches!(backend.architecture(other), Err(OffloadError::InvalidDevice(_))));
        assert!(matches!(backend.create_queue(other), Err(OffloadError::InvalidDevice(_))));
    }

    #[test]
    fn test_async_copy_lands_after_synchronize() {
        let backend = backend();
        let queue = backend.create_queue(DEV).unwrap();
        let buffer = backend.allocate(DEV, Some(queue), 4).unwrap();
        assert_eq!(backend.allocation_origin(buffer), Some(queue));

        backend.pause_queues();
        backend.copy_to_device(DEV, Some(queue), buffer, 0, &[9, 8, 7, 6]).unwrap();
        assert_eq!(backend.pending_operations(queue).unwrap(), 1);
        assert_eq!(
            backend.synchronize(queue, Some(Duration::from_millis(10))).unwrap(),
            SyncStatus::TimedOut
        );

        backend.resume_queues();
        assert_eq!(backend.synchronize(queue, None).unwrap(), SyncStatus::Complete);
        assert_eq!(backend.read_allocation(DEV, buffer).unwrap(), vec![9, 8, 7, 6]);
        let completed_at = backend.queue_last_completion(queue).unwrap();
        assert!(completed_at > 0);

        backend.release(DEV, buffer).unwrap();
        assert!(backend.release_log()[0].sequence > completed_at);
        backend.destroy_queue(queue).unwrap();
        assert!(matches!(
            backend.synchronize(queue, None),
            Err(OffloadError::InvalidQueue(_))
        ));
    }

    #[test]
    fn test_copy_out_of_bounds_rejected_at_enqueue() {
        let backend = backend();
        let buffer = backend.allocate(DEV, None, 2).unwrap();
        assert!(matches!(
            backend.copy_to_device(DEV, None, buffer, 0, &[1, 2, 3]),
            Err(OffloadError::AllocationOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_queue_from_other_device_rejected() {
        let backend = backend();
        let other = DeviceHandle::new(0, 1);
        backend.add_device(other, "arch-x");
        let queue = backend.create_queue(other).unwrap();
        assert!(matches!(
            backend.allocate(DEV, Some(queue), 8),
            Err(OffloadError::InvalidQueue(q)) if q == queue
        ));
    }

    #[test]
    fn test_launch_requires_loaded_kernel() {
        let backend = backend();
        let loaded = backend.load_image(DEV, &image()).unwrap();
        let kernel = loaded.entries[0].address;
        let global = loaded.entries[1].address;
        let env: Arc<[u8]> = Arc::from(vec![1u8, 2, 3]);

        backend.launch_kernel(DEV, None, kernel, Arc::clone(&env), &[42]).unwrap();
        assert!(backend.launch_kernel(DEV, None, global, Arc::clone(&env), &[]).is_err());

        let launches = backend.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].args, vec![42]);
        assert_eq!(launches[0].launch_buffer, vec![1, 2, 3]);

        backend.unload_image(DEV, loaded.key).unwrap();
        assert!(backend.launch_kernel(DEV, None, kernel, env, &[]).is_err());
    }

    #[test]
    fn test_injected_failure_surfaces_once() {
        let backend = backend();
        let queue = backend.create_queue(DEV).unwrap();
        backend.inject_queue_failure(queue, "ecc error").unwrap();
        assert!(matches!(
            backend.synchronize(queue, None),
            Err(OffloadError::QueueFailure { .. })
        ));
        assert_eq!(backend.synchronize(queue, None).unwrap(), SyncStatus::Complete);
    }
}
