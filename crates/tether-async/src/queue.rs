//! Execution queues for continuation delivery.
//!
//! A [`Queue`] is the logical execution context that promise continuations
//! and consumer callbacks run on. Two flavors exist:
//!
//! - **Inline**: the job runs synchronously in whichever task or thread
//!   dispatched it. Cheap, ordered by construction, and available without a
//!   runtime.
//! - **Serial**: jobs are sent over an unbounded channel to a dedicated
//!   tokio task that executes them one at a time, in FIFO order. Creating a
//!   serial queue therefore requires an active tokio runtime.
//!
//! A panicking job is caught and logged rather than allowed to unwind
//! through the drain task, so a single malformed callback cannot stop the
//! queue for everyone else.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

/// A handle to an execution queue. Cloning yields another handle to the
/// same underlying queue.
#[derive(Clone)]
pub struct Queue {
    kind: QueueKind,
}

#[derive(Clone)]
enum QueueKind {
    Inline,
    Serial(Arc<SerialQueue>),
}

struct SerialQueue {
    label: String,
    jobs: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
}

impl Queue {
    /// Returns the queue that runs jobs synchronously in the caller.
    pub fn inline() -> Self {
        Queue {
            kind: QueueKind::Inline,
        }
    }

    /// Spawns a serial queue draining jobs one at a time in FIFO order.
    ///
    /// The label appears in log output and is useful when several queues
    /// are live at once.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, since the drain task must
    /// be spawned somewhere.
    pub fn serial(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let task_label = label.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                warn!(queue = %task_label, "queued job panicked");
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!(queue = %task_label, "serial queue stopped");
        });

        Queue {
            kind: QueueKind::Serial(Arc::new(SerialQueue { label, jobs: tx, cancel })),
        }
    }

    /// The queue's label (`"inline"` for the inline queue).
    pub fn label(&self) -> &str {
        match &self.kind {
            QueueKind::Inline => "inline",
            QueueKind::Serial(queue) => &queue.label,
        }
    }

    /// Whether this queue serializes jobs on a dedicated task.
    pub fn is_serial(&self) -> bool {
        matches!(self.kind, QueueKind::Serial(_))
    }

    /// Runs or enqueues a job.
    ///
    /// Inline queues invoke the job before returning. Serial queues enqueue
    /// it behind every previously dispatched job; a job dispatched after
    /// [`Queue::shutdown`] is dropped with a warning.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        match &self.kind {
            QueueKind::Inline => job(),
            QueueKind::Serial(queue) => {
                if queue.jobs.send(Box::new(job)).is_err() {
                    warn!(queue = %queue.label, "job dispatched to a stopped queue was dropped");
                }
            }
        }
    }

    /// Stops a serial queue's drain task. Jobs not yet executed are
    /// dropped. A no-op for the inline queue.
    pub fn shutdown(&self) {
        if let QueueKind::Serial(queue) = &self.kind {
            queue.cancel.cancel();
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("label", &self.label()).finish()
    }
}
