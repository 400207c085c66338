//! # Offload FFI
//!
//! C ABI surface of the offload runtime for host code generators and
//! separately compiled device plugins.
//!
//! ## Architecture
//!
//! The FFI uses handle-based object management so that nothing crossing the
//! boundary owns Rust memory:
//!
//! - **Runtime** - one process-wide [`OffloadRuntime`], installed explicitly
//! - **Registration** - u64 registration id returned by `offload_register`
//! - **Async context** - u64 handle into the context registry
//! - **Resolved table** - raw entry range kept alive until `offload_unload`
//!
//! Every function returns an [`OffloadStatus`]; outputs are written through
//! pointer arguments only on success. Handle 0 is never valid.

mod handles;
mod status;

use std::ffi::{c_char, CStr};
use std::slice;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use offload_runtime::{
    AllocationHandle, BinaryDescriptor, ContextState, DeviceHandle, HostBackend, OffloadError, OffloadRuntime,
    RawBinaryDescriptor, RawDeviceInfo, RawImageInfo, RawTableStorage, RawTargetTable, RegistrationId, RuntimeConfig,
    ABI_VERSION,
};

use offload_tracing::{TracingConfig, TracingSetupError};

use handles::{
    context, current_runtime, generate_handle, host_backend, lock_registry, CachedTable, CONTEXT_REGISTRY, RUNTIME,
    TABLE_REGISTRY,
};

pub use handles::clear_all_registries;
pub use status::OffloadStatus;

type FfiResult<T> = Result<T, OffloadStatus>;

/// Log a runtime error and convert it to its status code
fn check<T>(operation: &'static str, result: offload_runtime::Result<T>) -> FfiResult<T> {
    result.map_err(|error| {
        tracing::error!(operation, error = %error, "offload call failed");
        OffloadStatus::from(&error)
    })
}

fn finish(result: FfiResult<()>) -> OffloadStatus {
    match result {
        Ok(()) => OffloadStatus::Success,
        Err(status) => status,
    }
}

/// # Safety
///
/// `out` must be null or valid for a write of `T`.
unsafe fn write_out<T>(out: *mut T, value: T) -> FfiResult<()> {
    if out.is_null() {
        return Err(OffloadStatus::InvalidArgument);
    }
    out.write(value);
    Ok(())
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn c_str<'a>(ptr: *const c_char) -> FfiResult<&'a str> {
    if ptr.is_null() {
        return Err(OffloadStatus::InvalidArgument);
    }
    CStr::from_ptr(ptr).to_str().map_err(|_| OffloadStatus::InvalidArgument)
}

// ============================================================================
// Runtime
// ============================================================================

/// Layout version of the raw records this library understands
#[no_mangle]
pub extern "C" fn offload_abi_version() -> u32 {
    ABI_VERSION
}

/// Install the process-wide tracing subscriber from `OFFLOAD_TRACING_*` variables
///
/// Returns `InvalidArgument` for unparseable directives and `BackendError`
/// if a subscriber is already installed.
#[no_mangle]
pub extern "C" fn offload_init_tracing() -> OffloadStatus {
    match offload_tracing::init_global_tracing(&TracingConfig::from_env()) {
        Ok(()) => OffloadStatus::Success,
        Err(TracingSetupError::InvalidFilter(_)) => OffloadStatus::InvalidArgument,
        Err(TracingSetupError::SubscriberInit(_)) => OffloadStatus::BackendError,
    }
}

/// Install a fresh runtime on the host backend
///
/// `config_json` may be null for the default configuration. Installing
/// replaces the previous runtime and invalidates every table it handed out.
///
/// # Safety
///
/// `config_json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn offload_install_host_backend(config_json: *const c_char) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        let config = if config_json.is_null() {
            RuntimeConfig::default()
        } else {
            check("install", RuntimeConfig::from_json(c_str(config_json)?))?
        };

        let runtime = OffloadRuntime::with_config(Arc::new(HostBackend::new()), config);
        lock_registry(&TABLE_REGISTRY).clear();
        *lock_registry(&RUNTIME) = Some(Arc::new(runtime));
        tracing::info!("host backend installed");
        Ok(())
    })())
}

/// Add a device to the installed host backend
///
/// # Safety
///
/// `architecture` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn offload_add_host_device(device: RawDeviceInfo, architecture: *const c_char) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        let architecture = c_str(architecture)?;
        let runtime = current_runtime()?;
        host_backend(&runtime)?.add_device(device.into(), architecture);
        Ok(())
    })())
}

// ============================================================================
// Registration and Loading
// ============================================================================

/// Register a binary descriptor
///
/// The descriptor is copied; the caller's records may be freed afterwards.
///
/// # Safety
///
/// `desc` and `infos` must satisfy [`BinaryDescriptor::from_raw`]; `out_id`
/// must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn offload_register(
    desc: *const RawBinaryDescriptor,
    infos: *const RawImageInfo,
    out_id: *mut u64,
) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        if out_id.is_null() {
            return Err(OffloadStatus::InvalidArgument);
        }
        let runtime = current_runtime()?;
        let descriptor = check("register", BinaryDescriptor::from_raw(desc, infos))?;
        let id = runtime.register(descriptor);
        write_out(out_id, id.id())
    })())
}

/// Drop a registration; unload it from every device first
#[no_mangle]
pub extern "C" fn offload_unregister(id: u64) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        let runtime = current_runtime()?;
        check("unregister", runtime.unregister(RegistrationId(id)))
    })())
}

/// Load a registered binary on a device and expose its resolved table
///
/// The table range stays valid until `offload_unload` for the same pair.
///
/// # Safety
///
/// `out_table` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn offload_load(device: RawDeviceInfo, id: u64, out_table: *mut RawTargetTable) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        if out_table.is_null() {
            return Err(OffloadStatus::InvalidArgument);
        }
        let runtime = current_runtime()?;
        let device = DeviceHandle::from(device);
        let id = RegistrationId(id);
        let table = check("load", runtime.load(device, id))?;

        // A view left behind by an unload racing this call belongs to an older table
        let mut tables = lock_registry(&TABLE_REGISTRY);
        let current = tables
            .get(&(device, id))
            .is_some_and(|cached| Arc::ptr_eq(&cached.table, &table));
        if !current {
            let storage = check("load", RawTableStorage::new(&table))?;
            tables.insert((device, id), CachedTable { table, storage });
        }
        let view = tables
            .get(&(device, id))
            .map(|cached| cached.storage.as_raw())
            .ok_or(OffloadStatus::BackendError)?;
        write_out(out_table, view)
    })())
}

/// Unload a binary from a device; its table range becomes invalid
#[no_mangle]
pub extern "C" fn offload_unload(device: RawDeviceInfo, id: u64) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        let runtime = current_runtime()?;
        let device = DeviceHandle::from(device);
        let id = RegistrationId(id);
        check("unload", runtime.unload(device, id))?;
        lock_registry(&TABLE_REGISTRY).remove(&(device, id));
        Ok(())
    })())
}

// ============================================================================
// Async Contexts
// ============================================================================

/// Create an async context on a device
///
/// # Safety
///
/// `out_ctx` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn offload_create_async_context(device: RawDeviceInfo, out_ctx: *mut u64) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        if out_ctx.is_null() {
            return Err(OffloadStatus::InvalidArgument);
        }
        let runtime = current_runtime()?;
        let ctx = check("create_async_context", runtime.create_async_context(device.into()))?;
        let handle = generate_handle();
        lock_registry(&CONTEXT_REGISTRY).insert(handle, Arc::new(Mutex::new(ctx)));
        tracing::debug!(handle, "async context created");
        write_out(out_ctx, handle)
    })())
}

/// Allocate device memory on the context's stream and attach it
///
/// # Safety
///
/// `out_allocation` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn offload_allocate(ctx: u64, size: usize, out_allocation: *mut u64) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        if out_allocation.is_null() {
            return Err(OffloadStatus::InvalidArgument);
        }
        let shared = context(ctx)?;
        let allocation = check("allocate", lock_registry(&shared).allocate(size))?;
        write_out(out_allocation, allocation.id())
    })())
}

/// Attach an allocation produced on the context's stream
#[no_mangle]
pub extern "C" fn offload_attach_allocation(ctx: u64, allocation: u64) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        let shared = context(ctx)?;
        let mut ctx = lock_registry(&shared);
        check("attach_allocation", ctx.attach_allocation(AllocationHandle::new(allocation)))
    })())
}

/// Fill the context's launch buffer
///
/// The bytes are copied before this returns.
///
/// # Safety
///
/// `bytes` must be valid for reads of `len` bytes, or null with `len == 0`.
#[no_mangle]
pub unsafe extern "C" fn offload_set_launch_buffer(ctx: u64, bytes: *const u8, len: usize) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        let data = match (bytes.is_null(), len) {
            (true, 0) => &[][..],
            (true, _) => return Err(OffloadStatus::InvalidArgument),
            (false, _) => slice::from_raw_parts(bytes, len),
        };
        let shared = context(ctx)?;
        let mut ctx = lock_registry(&shared);
        check("set_launch_buffer", ctx.set_launch_buffer(data))
    })())
}

/// Wait for the context's queue; a negative `timeout_ms` waits forever
///
/// Returns `Timeout` with the context still draining when the queue does not
/// complete in time; the call may be repeated.
#[no_mangle]
pub extern "C" fn offload_synchronize(ctx: u64, timeout_ms: i64) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
        let shared = context(ctx)?;
        let mut ctx = lock_registry(&shared);
        check("synchronize", ctx.synchronize(timeout))
    })())
}

/// Drain the context if needed and release every attached allocation
///
/// Finalizing twice is a no-op.
#[no_mangle]
pub extern "C" fn offload_finalize(ctx: u64) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        let shared = context(ctx)?;
        let mut ctx = lock_registry(&shared);
        check("finalize", ctx.finalize())
    })())
}

/// Forget a finalized context; its handle becomes invalid
///
/// A context that was not finalized is kept and `ContextNotFinalized` is
/// returned, so its allocations are never leaked silently.
#[no_mangle]
pub extern "C" fn offload_destroy_async_context(ctx: u64) -> OffloadStatus {
    finish((|| -> FfiResult<()> {
        // The registry lock is not held while waiting on a context busy elsewhere
        let shared = context(ctx)?;
        let state = lock_registry(&shared).state();
        if state != ContextState::Finalized {
            return check("destroy_async_context", Err(OffloadError::ContextNotFinalized { state }));
        }
        lock_registry(&CONTEXT_REGISTRY).remove(&ctx);
        tracing::debug!(handle = ctx, "async context destroyed");
        Ok(())
    })())
}
