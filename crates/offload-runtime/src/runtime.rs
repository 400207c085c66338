//! Registration and per-device loading
//!
//! [`OffloadRuntime`] records binary descriptors at registration time and
//! loads them lazily, once per device, on first use. Loading selects the
//! image for the device's architecture, hands it to the backend and resolves
//! the host entries against the addresses the backend assigned.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use offload_tracing::timed_block;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, DeviceHandle, ImageKey};
use crate::binary::BinaryDescriptor;
use crate::config::RuntimeConfig;
use crate::context::AsyncContext;
use crate::error::{OffloadError, Result};
use crate::resolve::resolve_entries;
use crate::select::select_image;
use crate::table::ResolvedTable;

/// Identifier returned by [`OffloadRuntime::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationId(pub u64);

impl RegistrationId {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg{}", self.0)
    }
}

struct LoadedBinary {
    /// `None` for host-only binaries, which load nothing onto the device
    image: Option<ImageKey>,
    table: Arc<ResolvedTable>,
}

/// Registration and dispatch boundary between host code and device backends
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use offload_runtime::{BinaryDescriptor, DeviceHandle, DeviceImage, EntryRecord, HostBackend, OffloadRuntime};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Arc::new(HostBackend::new());
/// let device = DeviceHandle::new(0, 0);
/// backend.add_device(device, "arch-x");
///
/// let runtime = OffloadRuntime::new(backend);
/// let id = runtime.register(
///     BinaryDescriptor::new()
///         .with_image(DeviceImage::new("arch-x", vec![0; 16], vec![EntryRecord::function("kernel1")]))
///         .with_host_entry(EntryRecord::function("kernel1")),
/// );
///
/// let table = runtime.load(device, id)?;
/// assert!(!table.address_of("kernel1").unwrap().is_null());
///
/// runtime.unload(device, id)?;
/// runtime.unregister(id)?;
/// # Ok(())
/// # }
/// ```
pub struct OffloadRuntime {
    backend: Arc<dyn Backend>,
    config: RuntimeConfig,
    registrations: RwLock<HashMap<RegistrationId, Arc<BinaryDescriptor>>>,
    /// Also serializes load and unload
    loaded: Mutex<HashMap<(DeviceHandle, RegistrationId), LoadedBinary>>,
    next_registration: AtomicU64,
    next_context: AtomicU64,
}

impl OffloadRuntime {
    /// Create a runtime with the default configuration
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_config(backend, RuntimeConfig::default())
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: RuntimeConfig) -> Self {
        tracing::info!(backend = backend.name(), ?config, "offload runtime created");
        Self {
            backend,
            config,
            registrations: RwLock::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
            next_registration: AtomicU64::new(1),
            next_context: AtomicU64::new(1),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ============================================================================================
    // Registration
    // ============================================================================================

    /// Record a descriptor for later per-device loading
    ///
    /// Nothing is validated or loaded here; name correspondence is checked
    /// when the descriptor is first loaded on a device.
    pub fn register(&self, descriptor: BinaryDescriptor) -> RegistrationId {
        let id = RegistrationId(self.next_registration.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(
            %id,
            images = descriptor.images.len(),
            host_entries = descriptor.host_entries.len(),
            "binary registered"
        );
        self.registrations.write().insert(id, Arc::new(descriptor));
        id
    }

    /// Drop the bookkeeping record for a registration
    ///
    /// Callers unload the binary from every device first. Tables still
    /// loaded are left in place and reported with a warning.
    pub fn unregister(&self, id: RegistrationId) -> Result<()> {
        self.registrations
            .write()
            .remove(&id)
            .ok_or(OffloadError::InvalidRegistration(id))?;

        let still_loaded = self.loaded_devices(id);
        if !still_loaded.is_empty() {
            tracing::warn!(%id, devices = ?still_loaded, "unregistered while still loaded");
        }
        tracing::debug!(%id, "binary unregistered");
        Ok(())
    }

    pub fn registered_count(&self) -> usize {
        self.registrations.read().len()
    }

    /// Registered descriptor, shared read-only
    pub fn descriptor(&self, id: RegistrationId) -> Option<Arc<BinaryDescriptor>> {
        self.registrations.read().get(&id).cloned()
    }

    // ============================================================================================
    // Loading
    // ============================================================================================

    /// Load a registered binary onto `device` and return its resolved table
    ///
    /// The first call per (device, registration) loads; later calls return
    /// the cached table.
    ///
    /// # Errors
    ///
    /// - `InvalidRegistration` for an unknown id
    /// - `MalformedBinary` if host and image entries do not correspond
    /// - `NoCompatibleImage` / `DuplicateImage` from image selection
    /// - `UnresolvedSymbol` for a required symbol the image does not define
    ///
    /// On error the binary is not loaded on the device.
    pub fn load(&self, device: DeviceHandle, id: RegistrationId) -> Result<Arc<ResolvedTable>> {
        let descriptor = self.descriptor(id).ok_or(OffloadError::InvalidRegistration(id))?;

        let mut loaded = self.loaded.lock();
        if let Some(existing) = loaded.get(&(device, id)) {
            return Ok(Arc::clone(&existing.table));
        }

        let (result, duration_us) = timed_block!("load_binary", { self.load_on_device(device, &descriptor) });
        let binary = result?;
        let table = Arc::clone(&binary.table);
        loaded.insert((device, id), binary);

        tracing::info!(%id, %device, symbols = table.len(), duration_us, "binary loaded");
        Ok(table)
    }

    fn load_on_device(&self, device: DeviceHandle, descriptor: &BinaryDescriptor) -> Result<LoadedBinary> {
        if !self.backend.is_valid_device(device) {
            return Err(OffloadError::InvalidDevice(device));
        }
        descriptor.check_host_entries()?;

        if descriptor.is_host_only() {
            if !descriptor.host_entries.is_empty() {
                return Err(OffloadError::NoCompatibleImage {
                    architecture: self.backend.architecture(device)?,
                    available: Vec::new(),
                });
            }
            return Ok(LoadedBinary {
                image: None,
                table: Arc::new(ResolvedTable::default()),
            });
        }

        let architecture = self.backend.architecture(device)?;
        let image = select_image(descriptor, &architecture)?;
        image.check_entries()?;

        let image_loaded = self.backend.load_image(device, image)?;
        match resolve_entries(
            &descriptor.host_entries,
            &image_loaded.entries,
            self.config.resolve_options(),
            device,
        ) {
            Ok(table) => Ok(LoadedBinary {
                image: Some(image_loaded.key),
                table: Arc::new(table),
            }),
            Err(e) => {
                if let Err(unload_err) = self.backend.unload_image(device, image_loaded.key) {
                    tracing::warn!(%device, error = %unload_err, "failed to unload image after resolution error");
                }
                Err(e)
            }
        }
    }

    /// Unload a binary from a device and destroy its resolved table
    pub fn unload(&self, device: DeviceHandle, id: RegistrationId) -> Result<()> {
        let binary = self
            .loaded
            .lock()
            .remove(&(device, id))
            .ok_or(OffloadError::NotLoaded { id, device })?;

        if let Some(image) = binary.image {
            self.backend.unload_image(device, image)?;
        }
        tracing::debug!(%id, %device, "binary unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, device: DeviceHandle, id: RegistrationId) -> bool {
        self.loaded.lock().contains_key(&(device, id))
    }

    /// Devices the registration is currently loaded on, sorted
    pub fn loaded_devices(&self, id: RegistrationId) -> Vec<DeviceHandle> {
        let mut devices: Vec<_> = self
            .loaded
            .lock()
            .keys()
            .filter(|(_, loaded_id)| *loaded_id == id)
            .map(|(device, _)| *device)
            .collect();
        devices.sort();
        devices
    }

    /// Resolved table of a loaded binary, without loading
    pub fn table(&self, device: DeviceHandle, id: RegistrationId) -> Option<Arc<ResolvedTable>> {
        self.loaded.lock().get(&(device, id)).map(|binary| Arc::clone(&binary.table))
    }

    // ============================================================================================
    // Async Contexts
    // ============================================================================================

    /// Create a fresh async context on `device`
    ///
    /// No queue is created until the context's first asynchronous operation.
    pub fn create_async_context(&self, device: DeviceHandle) -> Result<AsyncContext> {
        if !self.backend.is_valid_device(device) {
            return Err(OffloadError::InvalidDevice(device));
        }
        Ok(AsyncContext::new(
            self.next_context.fetch_add(1, Ordering::SeqCst),
            Arc::clone(&self.backend),
            device,
            self.config.execution_mode,
            self.config.default_sync_timeout(),
        ))
    }
}

impl fmt::Debug for OffloadRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadRuntime")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("registered", &self.registered_count())
            .finish()
    }
}
