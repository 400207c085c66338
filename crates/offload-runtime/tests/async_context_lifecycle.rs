//! Integration tests for async context draining and deferred release

use std::sync::Arc;
use std::time::Duration;

use offload_runtime::{
    BinaryDescriptor, ContextState, DeviceAddress, DeviceHandle, DeviceImage, EntryRecord, HostBackend,
    KernelLaunchEnvironment, OffloadError, OffloadRuntime, Result, RuntimeConfig,
};

const DEV: DeviceHandle = DeviceHandle::new(0, 0);

fn setup(config: RuntimeConfig) -> (Arc<HostBackend>, OffloadRuntime) {
    offload_tracing::init_test_tracing();
    let backend = Arc::new(HostBackend::new());
    backend.add_device(DEV, "arch-x");
    (backend.clone(), OffloadRuntime::with_config(backend, config))
}

fn load_kernel(runtime: &OffloadRuntime) -> Result<DeviceAddress> {
    let id = runtime.register(
        BinaryDescriptor::new()
            .with_image(DeviceImage::new("arch-x", vec![0; 4], vec![EntryRecord::function("kernel1")]))
            .with_host_entry(EntryRecord::function("kernel1")),
    );
    let table = runtime.load(DEV, id)?;
    table
        .address_of("kernel1")
        .ok_or_else(|| OffloadError::malformed("kernel1 missing from table"))
}

// ============================================================================
// Deferred Release
// ============================================================================

#[test]
fn test_allocations_released_after_queue_completion() -> Result<()> {
    let (backend, runtime) = setup(RuntimeConfig::default());
    let mut ctx = runtime.create_async_context(DEV)?;

    let a1 = ctx.allocate(32)?;
    let a2 = ctx.allocate(32)?;
    assert_eq!(ctx.allocations(), &[a1, a2]);
    let queue = ctx.queue().expect("asynchronous context creates a queue");

    backend.pause_queues();
    ctx.copy_to_device(a1, 0, &[1; 32])?;
    ctx.copy_to_device(a2, 0, &[2; 32])?;

    // Nothing may be released while the copies are held in flight
    assert!(matches!(
        ctx.synchronize(Some(Duration::from_millis(20))),
        Err(OffloadError::Timeout { .. })
    ));
    assert!(backend.release_log().is_empty());
    backend.resume_queues();
    ctx.finalize()?;

    let completed_at = backend.queue_last_completion(queue).unwrap_or(0);
    let releases = backend.release_log();
    assert_eq!(releases.len(), 2);
    assert_eq!(releases[0].allocation, a1);
    assert_eq!(releases[1].allocation, a2);
    assert!(releases.iter().all(|r| r.sequence > completed_at));
    assert!(releases[0].sequence < releases[1].sequence);
    assert_eq!(backend.live_allocations(), 0);
    Ok(())
}

#[test]
fn test_finalize_is_idempotent() -> Result<()> {
    let (backend, runtime) = setup(RuntimeConfig::default());
    let mut ctx = runtime.create_async_context(DEV)?;
    ctx.allocate(8)?;
    ctx.allocate(8)?;

    ctx.finalize()?;
    ctx.finalize()?;
    ctx.finalize()?;
    assert_eq!(ctx.state(), ContextState::Finalized);
    assert_eq!(backend.release_log().len(), 2);
    Ok(())
}

#[test]
fn test_externally_produced_allocation_attached() -> Result<()> {
    let (backend, runtime) = setup(RuntimeConfig::synchronous());
    let mut ctx = runtime.create_async_context(DEV)?;
    let a = offload_runtime::Backend::allocate(backend.as_ref(), DEV, None, 16)?;

    ctx.attach_allocation(a)?;
    assert_eq!(ctx.state(), ContextState::Active);
    ctx.finalize()?;
    assert_eq!(backend.release_log()[0].allocation, a);
    Ok(())
}

// ============================================================================
// Timeouts
// ============================================================================

#[test]
fn test_timeout_then_retry() -> Result<()> {
    let (backend, runtime) = setup(RuntimeConfig::default());
    let mut ctx = runtime.create_async_context(DEV)?;
    let a = ctx.allocate(4)?;

    backend.pause_queues();
    ctx.copy_to_device(a, 0, &[5; 4])?;

    let err = ctx
        .synchronize(Some(Duration::from_millis(25)))
        .expect_err("paused queue cannot drain");
    assert!(matches!(err, OffloadError::Timeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(ctx.state(), ContextState::Draining);
    assert!(backend.release_log().is_empty());

    // Still draining: no new work accepted
    assert!(matches!(ctx.allocate(4), Err(OffloadError::ContextClosed { .. })));

    backend.resume_queues();
    ctx.synchronize(Some(Duration::from_secs(5)))?;
    ctx.finalize()?;
    assert_eq!(backend.release_log().len(), 1);
    Ok(())
}

#[test]
fn test_finalize_uses_configured_timeout() -> Result<()> {
    let config = RuntimeConfig::from_json(r#"{ "default_sync_timeout_ms": 20 }"#)?;
    let (backend, runtime) = setup(config);
    let mut ctx = runtime.create_async_context(DEV)?;
    let a = ctx.allocate(4)?;

    backend.pause_queues();
    ctx.copy_to_device(a, 0, &[1; 4])?;
    assert!(matches!(
        ctx.finalize(),
        Err(OffloadError::Timeout { waited }) if waited == Duration::from_millis(20)
    ));
    assert_eq!(ctx.allocations(), &[a]);
    assert_eq!(backend.live_allocations(), 1);

    backend.resume_queues();
    ctx.synchronize(None)?;
    ctx.finalize()?;
    assert_eq!(backend.live_allocations(), 0);
    Ok(())
}

// ============================================================================
// Launch Buffer
// ============================================================================

#[test]
fn test_second_launch_while_in_flight_is_busy() -> Result<()> {
    let (backend, runtime) = setup(RuntimeConfig::default());
    let kernel = load_kernel(&runtime)?;
    let mut ctx = runtime.create_async_context(DEV)?;

    let env = KernelLaunchEnvironment {
        reduction_cnt: 4,
        reduction_iter_cnt: 1,
        reduction_buffer: 0,
    };
    backend.pause_queues();
    ctx.launch_with_environment(kernel, &env, &[1, 2])?;
    assert!(matches!(
        ctx.launch_with_environment(kernel, &env, &[3]),
        Err(OffloadError::LaunchBufferBusy)
    ));

    backend.resume_queues();
    ctx.synchronize(None)?;
    let launches = backend.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].launch_buffer, env.as_bytes());
    assert_eq!(launches[0].args, vec![1, 2]);
    ctx.finalize()?;
    Ok(())
}

#[test]
fn test_synchronous_launches_never_block_the_slot() -> Result<()> {
    let (backend, runtime) = setup(RuntimeConfig::synchronous());
    let kernel = load_kernel(&runtime)?;
    let mut ctx = runtime.create_async_context(DEV)?;

    for i in 0..3 {
        ctx.set_launch_buffer(&[i])?;
        ctx.launch(kernel, &[])?;
    }
    assert!(ctx.queue().is_none());
    assert_eq!(backend.launches().len(), 3);
    assert_eq!(backend.launches()[2].launch_buffer, vec![2]);
    ctx.finalize()?;
    Ok(())
}

// ============================================================================
// Independent Streams
// ============================================================================

#[test]
fn test_contexts_are_independent() -> Result<()> {
    let (backend, runtime) = setup(RuntimeConfig::default());
    let mut first = runtime.create_async_context(DEV)?;
    let mut second = runtime.create_async_context(DEV)?;
    assert_ne!(first.id(), second.id());

    let a = first.allocate(8)?;
    let b = second.allocate(8)?;
    assert_ne!(first.queue(), second.queue());

    second.finalize()?;
    assert_eq!(backend.release_log().len(), 1);
    assert_eq!(backend.release_log()[0].allocation, b);

    first.cancel();
    assert!(matches!(first.allocate(8), Err(OffloadError::ContextClosed { .. })));
    first.finalize()?;
    assert_eq!(backend.release_log()[1].allocation, a);
    Ok(())
}
