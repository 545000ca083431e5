//! Queue-bound chunk delivery with backpressure accounting.
//!
//! A [`Dispatcher`] is the execution engine behind every consumer: it owns
//! the callback that receives chunks, the queue the callback runs on, and
//! an atomic counter of deliveries that have been accepted but whose
//! callback has not yet finished. The counter is what callers observe for
//! backpressure, and [`Dispatcher::drain`] is the intentional await point
//! that waits for it to reach zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{trace, warn};

use tether_async::queue::Queue;

type ChunkCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Delivers byte chunks to a callback, inline or on a bound queue, and
/// tracks how many deliveries are still outstanding.
pub struct Dispatcher {
    queue: Queue,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    callback: Mutex<Option<ChunkCallback>>,
}

impl Dispatcher {
    /// Creates a dispatcher delivering on the given queue.
    ///
    /// With [`Queue::inline`] each chunk's callback runs synchronously in
    /// the submitting caller; with a serial queue, chunks from a single
    /// producer are delivered in submission order. No ordering is
    /// guaranteed across concurrent producers.
    pub fn new(queue: Queue, callback: impl Fn(Bytes) + Send + Sync + 'static) -> Self {
        Dispatcher {
            queue,
            pending: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            callback: Mutex::new(Some(Arc::new(callback))),
        }
    }

    /// The number of accepted chunks whose callback has not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the callback has been detached by [`drain`](Self::drain) or
    /// [`close_with`](Self::close_with).
    pub fn is_closed(&self) -> bool {
        self.lock_callback().is_none()
    }

    /// Accepts a chunk for delivery. Chunks submitted after close are
    /// dropped with a warning.
    ///
    /// The callback lock is held across the counter increment and the
    /// enqueue, so a concurrent close cannot slot its finalizer ahead of
    /// an accepted chunk. On the inline queue the callback therefore runs
    /// under that lock and must not submit to its own dispatcher.
    pub fn submit(&self, chunk: Bytes) {
        let guard = self.lock_callback();
        let Some(callback) = guard.as_ref().map(Arc::clone) else {
            warn!(len = chunk.len(), "chunk submitted to a closed dispatcher was dropped");
            return;
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        let pending = Arc::clone(&self.pending);
        let drained = Arc::clone(&self.drained);
        self.queue.dispatch(move || {
            callback(chunk);
            if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                drained.notify_waiters();
            }
        });
        drop(guard);
    }

    /// Waits until every accepted chunk's callback has finished, then
    /// detaches the callback so the dispatcher is permanently closed.
    ///
    /// The zero check and the detach happen under the callback lock, so a
    /// chunk racing this call is either fully accepted first (and waited
    /// for) or dropped.
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let mut callback = self.lock_callback();
                if self.pending.load(Ordering::Acquire) == 0 {
                    callback.take();
                    break;
                }
            }
            notified.await;
        }
        trace!(queue = self.queue.label(), "dispatcher drained");
    }

    /// Closes the dispatcher and schedules `finalizer` behind every chunk
    /// already submitted.
    ///
    /// On a serial queue the finalizer is enqueued after all previously
    /// dispatched callbacks and therefore runs once they have all
    /// finished; on the inline queue it runs before this call returns.
    /// This is how consumers signal completion without blocking.
    pub fn close_with(&self, finalizer: impl FnOnce() + Send + 'static) {
        // Chunks are only enqueued under the callback lock while the
        // callback is present, so once this take completes every accepted
        // chunk is already ahead of the finalizer in queue order.
        self.lock_callback().take();
        self.queue.dispatch(finalizer);
    }

    fn lock_callback(&self) -> std::sync::MutexGuard<'_, Option<ChunkCallback>> {
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.queue.label())
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}
