//! FIFO operation queues for the host backend
//!
//! Each queue owns one worker thread that drains a channel of tasks in
//! submission order. Submitting returns immediately; completion is observed
//! through [`HostQueue::synchronize`].
//!
//! ```text
//! submit() ──► mpsc channel ──► worker: gate.wait() → task() → completed += 1
//!                                                      │
//! synchronize() ◄──── Condvar notify ──────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::{DeviceHandle, QueueHandle, SyncStatus};
use crate::error::{OffloadError, Result};

/// Unit of work executed by a queue worker
pub(crate) type QueueTask = Box<dyn FnOnce() -> std::result::Result<(), String> + Send + 'static>;

/// Global pause switch shared by every queue of a backend
///
/// While closed, workers hold their next task without running it, which
/// keeps operations observably in flight.
pub(crate) struct QueueGate {
    paused: Mutex<bool>,
    changed: Condvar,
}

impl QueueGate {
    pub fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            changed: Condvar::new(),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        *self.paused.lock() = paused;
        self.changed.notify_all();
    }

    fn wait_open(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.changed.wait(&mut paused);
        }
    }
}

#[derive(Default)]
struct QueueProgress {
    submitted: u64,
    completed: u64,
    /// Event clock value of the most recent completion
    last_completion: u64,
    failure: Option<String>,
}

struct QueueShared {
    progress: Mutex<QueueProgress>,
    completed: Condvar,
}

pub(crate) struct HostQueue {
    handle: QueueHandle,
    device: DeviceHandle,
    sender: Mutex<Option<mpsc::Sender<QueueTask>>>,
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostQueue {
    /// Create the queue and start its worker thread
    pub fn spawn(
        handle: QueueHandle,
        device: DeviceHandle,
        gate: Arc<QueueGate>,
        clock: Arc<AtomicU64>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<QueueTask>();
        let shared = Arc::new(QueueShared {
            progress: Mutex::new(QueueProgress::default()),
            completed: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("offload-{handle}"))
            .spawn(move || {
                for task in receiver {
                    gate.wait_open();
                    let outcome = task();
                    let sequence = clock.fetch_add(1, Ordering::SeqCst) + 1;

                    let mut progress = worker_shared.progress.lock();
                    progress.completed += 1;
                    progress.last_completion = sequence;
                    if let Err(message) = outcome {
                        tracing::warn!(queue = %handle, %message, "queued operation failed");
                        progress.failure.get_or_insert(message);
                    }
                    worker_shared.completed.notify_all();
                }
            })
            .map_err(|e| OffloadError::backend(format!("failed to spawn worker for {handle}: {e}")))?;

        Ok(Self {
            handle,
            device,
            sender: Mutex::new(Some(sender)),
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    /// Enqueue a task; it runs after every previously submitted task
    pub fn submit(&self, task: QueueTask) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(OffloadError::InvalidQueue(self.handle))?;

        self.shared.progress.lock().submitted += 1;
        sender.send(task).map_err(|_| {
            self.shared.progress.lock().submitted -= 1;
            OffloadError::QueueFailure {
                queue: self.handle,
                message: "worker thread exited".to_string(),
            }
        })
    }

    /// Wait until every submitted task completed or `timeout` elapsed
    pub fn synchronize(&self, timeout: Option<Duration>) -> Result<SyncStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut progress = self.shared.progress.lock();

        while progress.completed < progress.submitted {
            match deadline {
                Some(deadline) => {
                    if self.shared.completed.wait_until(&mut progress, deadline).timed_out()
                        && progress.completed < progress.submitted
                    {
                        return Ok(SyncStatus::TimedOut);
                    }
                }
                None => self.shared.completed.wait(&mut progress),
            }
        }

        if let Some(message) = progress.failure.take() {
            return Err(OffloadError::QueueFailure {
                queue: self.handle,
                message,
            });
        }
        Ok(SyncStatus::Complete)
    }

    /// Record a failure that the next synchronize reports
    pub fn inject_failure(&self, message: String) {
        self.shared.progress.lock().failure = Some(message);
    }

    pub fn pending(&self) -> u64 {
        let progress = self.shared.progress.lock();
        progress.submitted - progress.completed
    }

    pub fn last_completion(&self) -> u64 {
        self.shared.progress.lock().last_completion
    }

    /// Stop accepting tasks and let the worker exit once the channel drains
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if self.pending() == 0 {
                let _ = worker.join();
            } else {
                tracing::warn!(queue = %self.handle, pending = self.pending(), "queue shut down with operations in flight");
            }
        }
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn queue(gate: &Arc<QueueGate>) -> HostQueue {
        HostQueue::spawn(
            QueueHandle::new(1),
            DeviceHandle::new(0, 0),
            Arc::clone(gate),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let gate = Arc::new(QueueGate::new());
        let q = queue(&gate);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let order = Arc::clone(&order);
            q.submit(Box::new(move || {
                order.lock().push(i);
                Ok(())
            }))
            .unwrap();
        }

        assert_eq!(q.synchronize(None).unwrap(), SyncStatus::Complete);
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
        assert_eq!(q.pending(), 0);
        assert!(q.last_completion() > 0);
    }

    #[test]
    fn test_paused_gate_times_out() {
        let gate = Arc::new(QueueGate::new());
        let q = queue(&gate);
        let ran = Arc::new(AtomicUsize::new(0));

        gate.set_paused(true);
        let counter = Arc::clone(&ran);
        q.submit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        assert_eq!(
            q.synchronize(Some(Duration::from_millis(20))).unwrap(),
            SyncStatus::TimedOut
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        gate.set_paused(false);
        assert_eq!(q.synchronize(None).unwrap(), SyncStatus::Complete);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_failure_reported_once() {
        let gate = Arc::new(QueueGate::new());
        let q = queue(&gate);
        q.submit(Box::new(|| Err("device fault".to_string()))).unwrap();

        match q.synchronize(None) {
            Err(OffloadError::QueueFailure { message, .. }) => assert_eq!(message, "device fault"),
            other => panic!("expected queue failure, got {other:?}"),
        }
        assert_eq!(q.synchronize(None).unwrap(), SyncStatus::Complete);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let gate = Arc::new(QueueGate::new());
        let q = queue(&gate);
        q.shutdown();
        assert!(matches!(
            q.submit(Box::new(|| Ok(()))),
            Err(OffloadError::InvalidQueue(_))
        ));
    }
}
