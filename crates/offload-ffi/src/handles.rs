//! Handle-based object management for FFI
//!
//! Process-wide registries for the installed runtime, async contexts and the
//! raw table storage handed out by `offload_load`, addressed through opaque
//! u64 handles.
//!
//! ## Thread Safety
//!
//! All registries use `Arc<Mutex<..>>`. Handle generation uses atomic
//! operations. Each context sits behind its own lock so one stream's drain
//! does not block the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use offload_runtime::{
    AsyncContext, DeviceHandle, HostBackend, OffloadRuntime, RawTableStorage, RegistrationId, ResolvedTable,
};

use crate::status::OffloadStatus;

// Global handle counter for unique handle generation
static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) type SharedContext = Arc<Mutex<AsyncContext>>;

/// Raw view of one resolved table, tied to the table it was built from
pub(crate) struct CachedTable {
    pub table: Arc<ResolvedTable>,
    pub storage: RawTableStorage,
}

// Global registries for object management
lazy_static::lazy_static! {
    /// Runtime every `offload_*` call dispatches to
    pub(crate) static ref RUNTIME: Arc<Mutex<Option<Arc<OffloadRuntime>>>> = Arc::new(Mutex::new(None));

    /// Registry of all live async contexts
    pub(crate) static ref CONTEXT_REGISTRY: Arc<Mutex<HashMap<u64, SharedContext>>> =
        Arc::new(Mutex::new(HashMap::new()));

    /// Raw entry storage backing every table returned by `offload_load`
    pub(crate) static ref TABLE_REGISTRY: Arc<Mutex<HashMap<(DeviceHandle, RegistrationId), CachedTable>>> =
        Arc::new(Mutex::new(HashMap::new()));
}

/// Generate a unique handle
///
/// Handles start at 1 (0 is reserved for invalid/null handles).
pub(crate) fn generate_handle() -> u64 {
    HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Lock a registry, recovering the data if a panic poisoned the mutex
pub(crate) fn lock_registry<T>(mutex: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Registry mutex was poisoned, recovering data");
            poisoned.into_inner()
        }
    }
}

/// Installed runtime, or `NotInitialized`
pub(crate) fn current_runtime() -> Result<Arc<OffloadRuntime>, OffloadStatus> {
    lock_registry(&RUNTIME).clone().ok_or(OffloadStatus::NotInitialized)
}

/// Host backend behind `runtime`, or `NotInitialized` when another backend drives it
pub(crate) fn host_backend(runtime: &OffloadRuntime) -> Result<&HostBackend, OffloadStatus> {
    runtime
        .backend()
        .as_any()
        .downcast_ref::<HostBackend>()
        .ok_or(OffloadStatus::NotInitialized)
}

pub(crate) fn context(handle: u64) -> Result<SharedContext, OffloadStatus> {
    lock_registry(&CONTEXT_REGISTRY)
        .get(&handle)
        .cloned()
        .ok_or(OffloadStatus::InvalidHandle)
}

/// Clear all registries and uninstall the runtime (for testing/debugging)
///
/// # Warning
///
/// This will invalidate all existing handles. Contexts that were not
/// finalized are dropped without releasing their allocations.
pub fn clear_all_registries() {
    lock_registry(&CONTEXT_REGISTRY).clear();
    lock_registry(&TABLE_REGISTRY).clear();
    lock_registry(&RUNTIME).take();
    tracing::info!("All registries cleared");
}
