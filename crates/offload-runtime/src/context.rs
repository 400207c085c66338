//! Async context lifecycle
//!
//! An [`AsyncContext`] tracks one ordered stream of device operations: the
//! backend queue they run on, the allocations scoped to that stream, and the
//! launch buffer slot. Allocations are released explicitly, once, at
//! [`AsyncContext::finalize`] and only after the queue reported completion.
//!
//! ```text
//!          first enqueue / attach           synchronize / cancel
//!   Idle ─────────────────────────► Active ─────────────────────► Draining
//!     │                               │ ▲                            │
//!     │                               └─┘ enqueue, attach            │ queue complete
//!     │                                                              ▼
//!     └─────────────── finalize (nothing to drain) ─────────────► Finalized
//! ```
//!
//! A context is single-use: nothing leaves `Finalized`, and no operation may
//! be enqueued once the context is `Draining`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use offload_tracing::lifecycle_event;
use tracing::field::display;

use crate::backend::{AllocationHandle, Backend, DeviceHandle, QueueHandle, SyncStatus};
use crate::config::ExecutionMode;
use crate::entry::DeviceAddress;
use crate::error::{OffloadError, Result};
use crate::launch::{KernelLaunchEnvironment, LaunchBuffer};

/// Lifecycle state of an [`AsyncContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// No operation issued yet
    Idle,
    /// Accepting operations and allocations
    Active,
    /// No further operations; waiting for the queue to complete
    Draining,
    /// Allocations released and queue destroyed
    Finalized,
}

impl ContextState {
    /// Whether new operations may be enqueued
    pub fn accepts_work(self) -> bool {
        matches!(self, ContextState::Idle | ContextState::Active)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Idle => "idle",
            ContextState::Active => "active",
            ContextState::Draining => "draining",
            ContextState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// One independent stream of asynchronous device work
///
/// Created by [`OffloadRuntime::create_async_context`](crate::OffloadRuntime::create_async_context).
/// Single writer, single drainer: wrap it in a lock to share across threads.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use offload_runtime::{ContextState, DeviceHandle, HostBackend, OffloadRuntime};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Arc::new(HostBackend::new());
/// let device = DeviceHandle::new(0, 0);
/// backend.add_device(device, "arch-x");
///
/// let runtime = OffloadRuntime::new(backend);
/// let mut ctx = runtime.create_async_context(device)?;
/// let buffer = ctx.allocate(256)?;
/// ctx.copy_to_device(buffer, 0, &[0xab; 256])?;
///
/// ctx.finalize()?;
/// assert_eq!(ctx.state(), ContextState::Finalized);
/// # Ok(())
/// # }
/// ```
pub struct AsyncContext {
    id: u64,
    backend: Arc<dyn Backend>,
    device: DeviceHandle,
    mode: ExecutionMode,
    sync_timeout: Option<Duration>,
    state: ContextState,
    queue: Option<QueueHandle>,
    drained: bool,
    allocations: Vec<AllocationHandle>,
    launch_buffer: LaunchBuffer,
}

impl AsyncContext {
    pub(crate) fn new(
        id: u64,
        backend: Arc<dyn Backend>,
        device: DeviceHandle,
        mode: ExecutionMode,
        sync_timeout: Option<Duration>,
    ) -> Self {
        lifecycle_event!("async_context", id = id, device = display(device), state = "created");
        Self {
            id,
            backend,
            device,
            mode,
            sync_timeout,
            state: ContextState::Idle,
            queue: None,
            drained: true,
            allocations: Vec::new(),
            launch_buffer: LaunchBuffer::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Backend queue; `None` until the first asynchronous operation, and
    /// always `None` in synchronous mode
    pub fn queue(&self) -> Option<QueueHandle> {
        self.queue
    }

    /// Attached allocations in attach order
    pub fn allocations(&self) -> &[AllocationHandle] {
        &self.allocations
    }

    /// Whether a synchronize observed completion of everything enqueued
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Whether the launch buffer may still be read by an in-flight launch
    pub fn launch_in_flight(&self) -> bool {
        self.launch_buffer.is_in_flight()
    }

    // ============================================================================================
    // Enqueue
    // ============================================================================================

    /// Record an allocation that the context releases at finalize
    ///
    /// The handle must come from an operation on this context's queue, or a
    /// synchronous operation on the same device.
    ///
    /// # Errors
    ///
    /// `ContextClosed` once draining, `AllocationAlreadyAttached` for a
    /// handle attached twice.
    pub fn attach_allocation(&mut self, allocation: AllocationHandle) -> Result<()> {
        self.ensure_open()?;
        if self.allocations.contains(&allocation) {
            return Err(OffloadError::AllocationAlreadyAttached(allocation));
        }
        self.allocations.push(allocation);
        self.transition(ContextState::Active);
        tracing::trace!(ctx = self.id, %allocation, attached = self.allocations.len(), "allocation attached");
        Ok(())
    }

    /// Allocate device memory on the context's stream and attach it
    pub fn allocate(&mut self, size: usize) -> Result<AllocationHandle> {
        let queue = self.activate()?;
        let allocation = self.backend.allocate(self.device, queue, size)?;
        self.allocations.push(allocation);
        Ok(allocation)
    }

    /// Enqueue a host-to-device copy
    ///
    /// `data` is copied by the backend before this returns.
    pub fn copy_to_device(&mut self, dst: AllocationHandle, offset: usize, data: &[u8]) -> Result<()> {
        let queue = self.activate()?;
        self.backend.copy_to_device(self.device, queue, dst, offset, data)
    }

    /// Fill the launch buffer slot for the next launch
    ///
    /// # Errors
    ///
    /// `LaunchBufferBusy` while a previous launch may still be reading it.
    pub fn set_launch_buffer(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.launch_buffer.fill(bytes)
    }

    /// Launch `kernel` with the current launch buffer contents
    ///
    /// An empty slot launches a zeroed [`KernelLaunchEnvironment`]. The slot
    /// stays reserved until a synchronize observes completion.
    pub fn launch(&mut self, kernel: DeviceAddress, args: &[u64]) -> Result<()> {
        self.ensure_open()?;
        let launch_buffer = self.launch_buffer.reserve()?;
        let queue = match self.activate() {
            Ok(queue) => queue,
            Err(e) => {
                self.launch_buffer.retire();
                return Err(e);
            }
        };

        let launched = self.backend.launch_kernel(self.device, queue, kernel, launch_buffer, args);
        if launched.is_err() || queue.is_none() {
            self.launch_buffer.retire();
        }
        launched
    }

    /// Fill the slot with `env` and launch `kernel`
    pub fn launch_with_environment(
        &mut self,
        kernel: DeviceAddress,
        env: &KernelLaunchEnvironment,
        args: &[u64],
    ) -> Result<()> {
        self.set_launch_buffer(env.as_bytes())?;
        self.launch(kernel, args)
    }

    // ============================================================================================
    // Drain and Finalize
    // ============================================================================================

    /// Stop accepting work; operations already enqueued still run
    pub fn cancel(&mut self) {
        if self.state.accepts_work() {
            self.transition(ContextState::Draining);
        }
    }

    /// Wait for every enqueued operation to complete
    ///
    /// Moves the context to `Draining`. On success the launch buffer is free
    /// again and the context is ready to finalize.
    ///
    /// # Errors
    ///
    /// `Timeout` if the queue is still busy after `timeout`, or the backend's
    /// queue failure. In both cases the context stays `Draining` and
    /// synchronize may be called again.
    pub fn synchronize(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state == ContextState::Finalized {
            return Ok(());
        }
        self.cancel();

        if let Some(queue) = self.queue {
            if !self.drained {
                match self.backend.synchronize(queue, timeout)? {
                    SyncStatus::Complete => {}
                    SyncStatus::TimedOut => {
                        tracing::debug!(ctx = self.id, %queue, ?timeout, "synchronize timed out");
                        return Err(OffloadError::Timeout {
                            waited: timeout.unwrap_or_default(),
                        });
                    }
                }
            }
        }

        self.drained = true;
        self.launch_buffer.retire();
        Ok(())
    }

    /// Drain if needed, then release every attached allocation and the queue
    ///
    /// Idempotent: finalizing a finalized context does nothing. Each
    /// allocation is handed to the backend exactly once, in attach order.
    ///
    /// # Errors
    ///
    /// Drain errors are returned with the context left `Draining` and
    /// nothing released. A failed release does not stop the remaining
    /// releases; the first such error is returned with the context
    /// `Finalized`.
    #[tracing::instrument(skip(self), fields(ctx = self.id, allocations = self.allocations.len()))]
    pub fn finalize(&mut self) -> Result<()> {
        if self.state == ContextState::Finalized {
            return Ok(());
        }
        if !self.drained || self.state.accepts_work() {
            self.synchronize(self.sync_timeout)?;
        }

        let mut first_error = None;
        for allocation in self.allocations.drain(..) {
            if let Err(e) = self.backend.release(self.device, allocation) {
                tracing::warn!(%allocation, error = %e, "release failed during finalize");
                first_error.get_or_insert(e);
            }
        }

        if let Some(queue) = self.queue.take() {
            if let Err(e) = self.backend.destroy_queue(queue) {
                tracing::warn!(%queue, error = %e, "queue destroy failed during finalize");
                first_error.get_or_insert(e);
            }
        }

        self.transition(ContextState::Finalized);
        first_error.map_or(Ok(()), Err)
    }

    // ============================================================================================
    // Internals
    // ============================================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.state.accepts_work() {
            Ok(())
        } else {
            Err(OffloadError::ContextClosed { state: self.state })
        }
    }

    /// Prepare for one more operation; returns the queue to issue it on
    fn activate(&mut self) -> Result<Option<QueueHandle>> {
        self.ensure_open()?;
        if self.mode == ExecutionMode::Asynchronous && self.queue.is_none() {
            let queue = self.backend.create_queue(self.device)?;
            tracing::debug!(ctx = self.id, %queue, "queue created");
            self.queue = Some(queue);
        }
        if self.queue.is_some() {
            self.drained = false;
        }
        self.transition(ContextState::Active);
        Ok(self.queue)
    }

    fn transition(&mut self, to: ContextState) {
        if self.state != to {
            lifecycle_event!("async_context", id = self.id, from = display(self.state), to = display(to));
            self.state = to;
        }
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("device", &self.device)
            .field("state", &self.state)
            .field("queue", &self.queue)
            .field("drained", &self.drained)
            .field("allocations", &self.allocations)
            .field("launch_buffer", &self.launch_buffer.bytes().map(<[u8]>::len))
            .field("launch_in_flight", &self.launch_buffer.is_in_flight())
            .finish()
    }
}

impl Drop for AsyncContext {
    fn drop(&mut self) {
        if self.state == ContextState::Finalized {
            return;
        }

        if let Some(queue) = self.queue.take() {
            // An idle queue can go; one with work in flight is left to the backend
            let idle = matches!(
                self.backend.synchronize(queue, Some(Duration::ZERO)),
                Ok(SyncStatus::Complete)
            );
            if idle && self.backend.destroy_queue(queue).is_ok() {
                tracing::debug!(ctx = self.id, %queue, "idle queue destroyed on drop");
            } else {
                tracing::warn!(
                    ctx = self.id,
                    state = %self.state,
                    %queue,
                    "async context dropped without finalize; queue leaked with operations in flight"
                );
            }
        }

        if !self.allocations.is_empty() {
            tracing::warn!(
                ctx = self.id,
                state = %self.state,
                allocations = self.allocations.len(),
                "async context dropped without finalize; allocations not released"
            );
        }
    }
}
