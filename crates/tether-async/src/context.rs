//! Scoped resources with guaranteed, exactly-once release.
//!
//! A [`Context`] pairs a promise that produces a resource (a service
//! connection, a listening socket, a subprocess handle) with the teardown
//! that must run once the resource is no longer in use. The terminal
//! combinator [`enter`](Context::enter) hands the body both the resource
//! and a pending teardown signal; release fires on the first of:
//!
//! - the body explicitly resolving the teardown signal,
//! - the body's promise settling (success, failure, or cancellation),
//! - cancellation of the promise returned by `enter`.
//!
//! If acquisition fails, the failed step handed nothing out and its own
//! release is not attempted; resources already acquired earlier in a
//! stacked chain are still released. If acquisition is cancelled but the
//! producer wins the race and yields a resource anyway, release still
//! fires exactly once.
//!
//! Teardowns for stacked acquisitions run in reverse-acquisition order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use tether_async::context::Context;
//! use tether_async::promise::Promise;
//! use tether_async::queue::Queue;
//!
//! let released = Arc::new(AtomicUsize::new(0));
//! let counter = released.clone();
//!
//! let context = Context::push(Promise::resolved("connection"), move |_conn| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//! let result = context.enter(&Queue::inline(), |conn, _teardown| {
//!     Promise::resolved(conn.len())
//! });
//!
//! assert_eq!(result.peek().unwrap().success(), Some(&10));
//! assert_eq!(released.load(Ordering::SeqCst), 1);
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::PromiseError;
use crate::promise::{panic_text, Outcome, Promise};
use crate::queue::Queue;

type Teardown = Box<dyn FnOnce() + Send>;
type Cancellation = Box<dyn FnOnce() + Send>;

/// An ordered stack of release actions, run at most once as a whole.
struct TeardownStack {
    cells: Mutex<Vec<Teardown>>,
}

impl TeardownStack {
    fn new(cells: Vec<Teardown>) -> Arc<Self> {
        Arc::new(TeardownStack {
            cells: Mutex::new(cells),
        })
    }

    /// Runs every teardown in reverse-acquisition order. Later calls find
    /// an empty stack and do nothing.
    fn run(&self) {
        let cells = {
            let mut guard = self
                .cells
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        if cells.is_empty() {
            return;
        }
        debug!(teardowns = cells.len(), "context teardown");
        for teardown in cells.into_iter().rev() {
            teardown();
        }
    }
}

/// A promise-producing operation whose resource requires guaranteed
/// release.
///
/// Contexts are consumed by their combinators; only
/// [`enter`](Context::enter) arranges for teardown to actually run, so a
/// context must always end in an `enter`.
pub struct Context<T> {
    future: Promise<T>,
    teardowns: Vec<Teardown>,
    // One cancel hook per stage of the acquisition chain, so cancelling
    // the entered promise reaches producers that are still pending.
    cancellations: Vec<Cancellation>,
}

impl<T: Send + Sync + 'static> Context<T> {
    /// Wraps a plain promise as a context with nothing to release.
    pub fn of(future: Promise<T>) -> Self {
        let source = future.clone();
        Context {
            future,
            teardowns: Vec::new(),
            cancellations: vec![Box::new(move || {
                source.cancel();
            })],
        }
    }

    /// Wraps a resource acquisition: `producer` yields the resource and
    /// `release` runs at most once, only if acquisition succeeded.
    ///
    /// Release receives the resource by reference; it never runs before
    /// the producer has actually yielded the resource.
    pub fn push(producer: Promise<T>, release: impl FnOnce(&T) + Send + 'static) -> Self {
        let mut context = Context::of(producer);
        context.push_teardown(release);
        context
    }

    fn push_teardown(&mut self, release: impl FnOnce(&T) + Send + 'static) {
        let resource = self.future.clone();
        self.teardowns.push(Box::new(move || {
            // Runs immediately when the producer already yielded; a still
            // pending producer arms the release to fire if it ever does.
            // Failed or cancelled producers never handed anything out.
            resource.on_completion(&Queue::inline(), move |outcome| {
                if let Outcome::Success(value) = &*outcome {
                    release(value);
                }
            });
        }));
    }

    /// Acquires a further resource derived from this one, stacking its
    /// release on top of the existing teardowns.
    pub fn acquire<U: Send + Sync + 'static>(
        self,
        queue: &Queue,
        producer: impl FnOnce(&T) -> Promise<U> + Send + 'static,
        release: impl FnOnce(&U) + Send + 'static,
    ) -> Context<U> {
        let Context {
            future,
            teardowns,
            mut cancellations,
        } = self;
        let chained = future.flat_map(queue, producer);
        let stage = chained.clone();
        cancellations.push(Box::new(move || {
            stage.cancel();
        }));
        let mut next = Context {
            future: chained,
            teardowns,
            cancellations,
        };
        next.push_teardown(release);
        next
    }

    /// Chains work that must run before teardown is established, such as a
    /// setup step that itself produces the eventual resource. The teardown
    /// stack carries over unchanged.
    pub fn pend<U: Send + Sync + 'static>(
        self,
        queue: &Queue,
        transform: impl FnOnce(&T) -> Promise<U> + Send + 'static,
    ) -> Context<U> {
        let Context {
            future,
            teardowns,
            mut cancellations,
        } = self;
        let chained = future.flat_map(queue, transform);
        let stage = chained.clone();
        cancellations.push(Box::new(move || {
            stage.cancel();
        }));
        Context {
            future: chained,
            teardowns,
            cancellations,
        }
    }

    /// Derives a context whose resource is `transform(resource)`, keeping
    /// the teardown stack.
    pub fn map<U: Send + Sync + 'static>(
        self,
        queue: &Queue,
        transform: impl FnOnce(&T) -> U + Send + 'static,
    ) -> Context<U> {
        let Context {
            future,
            teardowns,
            mut cancellations,
        } = self;
        let derived = future.map(queue, transform);
        let stage = derived.clone();
        cancellations.push(Box::new(move || {
            stage.cancel();
        }));
        Context {
            future: derived,
            teardowns,
            cancellations,
        }
    }

    /// The terminal combinator: runs `body` with the acquired resource and
    /// a pending teardown signal, and returns a promise for the body's
    /// result that settles after release has run.
    ///
    /// The body may resolve the teardown signal early to release the
    /// resource before it finishes; otherwise the signal is resolved
    /// automatically when the body's promise settles. Cancelling the
    /// returned promise cancels every still-pending stage of the
    /// acquisition chain and the body, and still guarantees release of
    /// anything acquired.
    pub fn enter<U: Send + Sync + 'static>(
        self,
        queue: &Queue,
        body: impl FnOnce(&T, Promise<()>) -> Promise<U> + Send + 'static,
    ) -> Promise<U> {
        let Context {
            future,
            teardowns,
            cancellations,
        } = self;
        let stack = TeardownStack::new(teardowns);
        let teardown_signal: Promise<()> = Promise::pending();
        let result: Promise<U> = Promise::pending();
        let body_slot: Arc<Mutex<Option<Promise<U>>>> = Arc::new(Mutex::new(None));

        // Release runs when the teardown signal settles, however it does.
        {
            let stack = Arc::clone(&stack);
            teardown_signal.on_completion(&Queue::inline(), move |_| stack.run());
        }

        {
            let result = result.clone();
            let signal = teardown_signal.clone();
            let stack = Arc::clone(&stack);
            let slot = Arc::clone(&body_slot);
            future.on_completion(queue, move |outcome| match &*outcome {
                Outcome::Success(value) => {
                    if result.is_settled() {
                        // Cancelled while acquiring, but the producer won
                        // the race: the resource exists and must still be
                        // released exactly once.
                        stack.run();
                        return;
                    }
                    let body_promise =
                        match catch_unwind(AssertUnwindSafe(|| body(value, signal.clone()))) {
                            Ok(promise) => promise,
                            Err(payload) => {
                                Promise::failed(PromiseError::Panicked(panic_text(payload)))
                            }
                        };
                    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                        Some(body_promise.clone());
                    body_promise.on_completion(&Queue::inline(), move |body_outcome| {
                        signal.resolve(());
                        result.settle_shared(body_outcome);
                    });
                }
                Outcome::Failure(error) => {
                    // The failed acquisition itself handed nothing out, but
                    // earlier stacked acquisitions may have succeeded; each
                    // teardown skips itself unless its producer yielded.
                    stack.run();
                    result.fail(error.clone());
                }
                Outcome::Cancelled => {
                    stack.run();
                    result.cancel();
                }
            });
        }

        result.on_cancel(move || {
            // Cancel every stage of the acquisition chain, not just the
            // tail: an un-cancelled upstream producer could otherwise win
            // later and hand a resource to a dead chain.
            for cancel in cancellations {
                cancel();
            }
            let body = body_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(body) = body {
                body.cancel();
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn of_has_no_teardown() {
        let context = Context::of(Promise::resolved(5u32));
        assert!(context.teardowns.is_empty());
    }

    #[test]
    fn push_records_one_teardown() {
        let context = Context::push(Promise::resolved(5u32), |_| {});
        assert_eq!(context.teardowns.len(), 1);
    }

    #[test]
    fn teardown_stack_runs_once_in_reverse() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        let stack = TeardownStack::new(vec![
            Box::new(move || first.lock().unwrap().push("first")),
            Box::new(move || second.lock().unwrap().push("second")),
        ]);

        stack.run();
        stack.run();

        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn release_skipped_when_producer_pending() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let mut context = Context::of(Promise::<u32>::pending());
        context.push_teardown(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let stack = TeardownStack::new(context.teardowns);
        stack.run();

        assert_eq!(released.load(Ordering::SeqCst), 0);
    }
}
