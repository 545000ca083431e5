//! Single-resolution promises and their combinators.
//!
//! A [`Promise`] represents a value or failure that becomes available at
//! most once. It starts pending and is settled by exactly one of
//! [`resolve`](Promise::resolve), [`fail`](Promise::fail), or
//! [`cancel`](Promise::cancel); the first caller wins and every later
//! attempt is a no-op. Continuations registered with
//! [`on_completion`](Promise::on_completion) fire exactly once, in
//! registration order, on the queue they were registered with.
//!
//! Combinators ([`map`](Promise::map), [`flat_map`](Promise::flat_map),
//! [`race`](Promise::race), [`join_all`](Promise::join_all), retries and
//! timeouts) derive new promises without blocking: all sequencing happens
//! through continuation registration. The only intentional await point is
//! [`outcome`](Promise::outcome), used at shutdown and in tests.
//!
//! # Example
//!
//! ```
//! use tether_async::promise::{Outcome, Promise};
//! use tether_async::queue::Queue;
//!
//! let port = Promise::pending();
//! let address = port.map(&Queue::inline(), |p: &u16| format!("127.0.0.1:{p}"));
//!
//! port.resolve(9800);
//! let outcome = address.peek().unwrap();
//! assert_eq!(outcome.success(), Some(&"127.0.0.1:9800".to_string()));
//! assert!(matches!(&*outcome, Outcome::Success(_)));
//! ```

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::error::PromiseError;
use crate::queue::Queue;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The terminal state of a settled promise.
///
/// Cancellation is deliberately distinct from failure so callers can decide
/// not to retry cancelled work.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The operation produced a value.
    Success(T),
    /// The operation failed.
    Failure(PromiseError),
    /// The operation was cancelled before it could produce a value.
    Cancelled,
}

impl<T> Outcome<T> {
    /// The value, if this outcome is a success.
    pub fn success(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// The error, if this outcome is a failure.
    pub fn failure(&self) -> Option<&PromiseError> {
        match self {
            Outcome::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// Whether this outcome is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// This outcome viewed as an error, for aggregation: failures yield
    /// their error, cancellations yield [`PromiseError::Cancelled`], and
    /// successes yield `None`.
    pub fn as_error(&self) -> Option<PromiseError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(error) => Some(error.clone()),
            Outcome::Cancelled => Some(PromiseError::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Configuration for [`Promise::retrying`].
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of attempts before the last failure is surfaced.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

type Continuation<T> = Box<dyn FnOnce(Arc<Outcome<T>>) + Send>;
type CancelHandler = Box<dyn FnOnce() + Send>;

enum State<T> {
    Pending {
        continuations: Vec<(Queue, Continuation<T>)>,
        cancel_handlers: Vec<CancelHandler>,
    },
    Settled(Arc<Outcome<T>>),
}

/// A single-resolution asynchronous result.
///
/// Cloning yields another handle to the same underlying state; any handle
/// may settle it, register continuations, or observe the outcome.
pub struct Promise<T> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Creates a pending promise.
    pub fn pending() -> Self {
        Promise {
            inner: Arc::new(Mutex::new(State::Pending {
                continuations: Vec::new(),
                cancel_handlers: Vec::new(),
            })),
        }
    }

    /// Creates a promise already settled with a value.
    pub fn resolved(value: T) -> Self {
        Self::settled(Outcome::Success(value))
    }

    /// Creates a promise already settled with a failure.
    pub fn failed(error: PromiseError) -> Self {
        Self::settled(Outcome::Failure(error))
    }

    /// Creates a promise already cancelled.
    pub fn cancelled() -> Self {
        Self::settled(Outcome::Cancelled)
    }

    fn settled(outcome: Outcome<T>) -> Self {
        Promise {
            inner: Arc::new(Mutex::new(State::Settled(Arc::new(outcome)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // User code never runs under this lock, so a poisoned mutex still
        // holds consistent state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Settling
    // -----------------------------------------------------------------------

    /// Settles this promise with a value. Returns `false` if it was
    /// already settled (the earlier terminal state is kept).
    pub fn resolve(&self, value: T) -> bool {
        self.settle_shared(Arc::new(Outcome::Success(value)))
    }

    /// Settles this promise with a failure. Returns `false` if it was
    /// already settled.
    pub fn fail(&self, error: PromiseError) -> bool {
        self.settle_shared(Arc::new(Outcome::Failure(error)))
    }

    /// Cancels this promise. Returns `false` if it was already settled;
    /// cancellation of settled promises is always a no-op, which is what
    /// makes loser cancellation in [`race`](Promise::race) safe.
    pub fn cancel(&self) -> bool {
        self.settle_shared(Arc::new(Outcome::Cancelled))
    }

    /// Installs the given outcome as the terminal state if still pending.
    ///
    /// Continuations fire after the state lock is released, each on its own
    /// queue, in registration order. Cancel handlers run only when the
    /// installed outcome is a cancellation.
    pub(crate) fn settle_shared(&self, outcome: Arc<Outcome<T>>) -> bool {
        let (continuations, cancel_handlers) = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, State::Settled(Arc::clone(&outcome))) {
                State::Settled(previous) => {
                    *state = State::Settled(previous);
                    return false;
                }
                State::Pending {
                    continuations,
                    cancel_handlers,
                } => (continuations, cancel_handlers),
            }
        };

        if outcome.is_cancelled() {
            for handler in cancel_handlers {
                handler();
            }
        }
        for (queue, continuation) in continuations {
            let shared = Arc::clone(&outcome);
            queue.dispatch(move || continuation(shared));
        }
        true
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Whether this promise has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(&*self.lock(), State::Settled(_))
    }

    /// The terminal outcome, if already settled.
    pub fn peek(&self) -> Option<Arc<Outcome<T>>> {
        match &*self.lock() {
            State::Settled(outcome) => Some(Arc::clone(outcome)),
            State::Pending { .. } => None,
        }
    }

    /// Waits for this promise to settle and returns the shared outcome.
    ///
    /// This is the explicit await boundary: nothing else in the core blocks
    /// on a promise. If every handle to a pending promise is dropped, the
    /// outcome reported here is [`Outcome::Cancelled`].
    pub async fn outcome(&self) -> Arc<Outcome<T>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.on_completion(&Queue::inline(), move |outcome| {
            let _ = tx.send(outcome);
        });
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Arc::new(Outcome::Cancelled),
        }
    }

    // -----------------------------------------------------------------------
    // Continuations
    // -----------------------------------------------------------------------

    /// Registers a continuation to run exactly once with the terminal
    /// outcome, on the given queue.
    ///
    /// If the promise is already settled the callback is dispatched after
    /// the state lock has been released, never reentrantly inside it.
    pub fn on_completion(
        &self,
        queue: &Queue,
        callback: impl FnOnce(Arc<Outcome<T>>) + Send + 'static,
    ) {
        let mut state = self.lock();
        match &mut *state {
            State::Pending { continuations, .. } => {
                continuations.push((queue.clone(), Box::new(callback)));
            }
            State::Settled(outcome) => {
                let outcome = Arc::clone(outcome);
                drop(state);
                queue.dispatch(move || callback(outcome));
            }
        }
    }

    /// Registers a handler that runs only if [`cancel`](Promise::cancel)
    /// wins the race to settle this promise.
    ///
    /// If the promise is already cancelled the handler runs immediately;
    /// if it settled any other way the handler is dropped.
    pub fn on_cancel(&self, handler: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending { cancel_handlers, .. } => {
                    cancel_handlers.push(Box::new(handler));
                    None
                }
                State::Settled(outcome) => outcome.is_cancelled().then_some(handler),
            }
        };
        if let Some(handler) = run_now {
            handler();
        }
    }

    // -----------------------------------------------------------------------
    // Combinators
    // -----------------------------------------------------------------------

    /// Derives a promise resolving to `transform(value)` once this one
    /// succeeds. Failure and cancellation propagate untouched. A panicking
    /// transform fails the derived promise with
    /// [`PromiseError::Panicked`].
    pub fn map<U: Send + Sync + 'static>(
        &self,
        queue: &Queue,
        transform: impl FnOnce(&T) -> U + Send + 'static,
    ) -> Promise<U> {
        self.try_map(queue, move |value| Ok(transform(value)))
    }

    /// Like [`map`](Promise::map) for fallible transforms: an `Err` fails
    /// the derived promise.
    pub fn try_map<U: Send + Sync + 'static>(
        &self,
        queue: &Queue,
        transform: impl FnOnce(&T) -> Result<U, PromiseError> + Send + 'static,
    ) -> Promise<U> {
        let derived = Promise::pending();
        let settle = derived.clone();
        self.on_completion(queue, move |outcome| match &*outcome {
            Outcome::Success(value) => {
                match catch_unwind(AssertUnwindSafe(|| transform(value))) {
                    Ok(Ok(mapped)) => {
                        settle.resolve(mapped);
                    }
                    Ok(Err(error)) => {
                        settle.fail(error);
                    }
                    Err(payload) => {
                        settle.fail(PromiseError::Panicked(panic_text(payload)));
                    }
                }
            }
            Outcome::Failure(error) => {
                settle.fail(error.clone());
            }
            Outcome::Cancelled => {
                settle.cancel();
            }
        });
        derived
    }

    /// Chains a promise-producing transform: the derived promise settles
    /// with the inner promise's outcome (a chain, not a nest).
    ///
    /// Cancelling the derived promise cancels the inner promise if the
    /// transform has already produced one; if the derived promise settles
    /// before this promise succeeds, the transform is never invoked.
    pub fn flat_map<U: Send + Sync + 'static>(
        &self,
        queue: &Queue,
        transform: impl FnOnce(&T) -> Promise<U> + Send + 'static,
    ) -> Promise<U> {
        let derived: Promise<U> = Promise::pending();
        let inner_slot: Arc<Mutex<Option<Promise<U>>>> = Arc::new(Mutex::new(None));

        let settle = derived.clone();
        let slot = Arc::clone(&inner_slot);
        self.on_completion(queue, move |outcome| match &*outcome {
            Outcome::Success(value) => {
                // The chain is dead once the derived promise has settled;
                // running the transform then would hand out work (or a
                // resource) nothing can observe.
                if settle.is_settled() {
                    return;
                }
                let inner = match catch_unwind(AssertUnwindSafe(|| transform(value))) {
                    Ok(inner) => inner,
                    Err(payload) => Promise::failed(PromiseError::Panicked(panic_text(payload))),
                };
                *lock_slot(&slot) = Some(inner.clone());
                inner.on_completion(&Queue::inline(), move |inner_outcome| {
                    settle.settle_shared(inner_outcome);
                });
            }
            Outcome::Failure(error) => {
                settle.fail(error.clone());
            }
            Outcome::Cancelled => {
                settle.cancel();
            }
        });

        derived.on_cancel(move || {
            if let Some(inner) = lock_slot(&inner_slot).take() {
                inner.cancel();
            }
        });
        derived
    }

    /// Resolves with the first of the given promises to settle, whatever
    /// its outcome. Every other entrant receives a best-effort
    /// [`cancel`](Promise::cancel); losers that already settled ignore it,
    /// and no loser cleanup ordering is guaranteed.
    ///
    /// Racing an empty set fails immediately, since no entrant could ever
    /// settle it.
    pub fn race(promises: Vec<Promise<T>>) -> Promise<T> {
        if promises.is_empty() {
            return Promise::failed(PromiseError::msg("cannot race an empty set of promises"));
        }

        let winner: Promise<T> = Promise::pending();
        let entrants = Arc::new(promises);
        for entrant in entrants.iter() {
            let winner = winner.clone();
            let entrants = Arc::clone(&entrants);
            entrant.on_completion(&Queue::inline(), move |outcome| {
                if winner.settle_shared(outcome) {
                    for loser in entrants.iter() {
                        loser.cancel();
                    }
                }
            });
        }

        let entrants = Arc::clone(&entrants);
        winner.on_cancel(move || {
            for entrant in entrants.iter() {
                entrant.cancel();
            }
        });
        winner
    }

    /// Settles once every input promise is terminal.
    ///
    /// Succeeds with the values in input order when all inputs succeeded;
    /// otherwise fails with the first failure *in input order*, even if a
    /// later input failed sooner in wall-clock time. A cancelled input
    /// counts as failed with [`PromiseError::Cancelled`].
    pub fn join_all(promises: Vec<Promise<T>>) -> Promise<Vec<T>>
    where
        T: Clone,
    {
        let aggregate: Promise<Vec<T>> = Promise::pending();
        if promises.is_empty() {
            aggregate.resolve(Vec::new());
            return aggregate;
        }

        let remaining = Arc::new(AtomicUsize::new(promises.len()));
        let entrants = Arc::new(promises);
        for entrant in entrants.iter() {
            let aggregate = aggregate.clone();
            let remaining = Arc::clone(&remaining);
            let entrants = Arc::clone(&entrants);
            entrant.on_completion(&Queue::inline(), move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                // Last input just settled: aggregate in input order.
                let mut values = Vec::with_capacity(entrants.len());
                for entrant in entrants.iter() {
                    let Some(outcome) = entrant.peek() else {
                        return;
                    };
                    if let Some(error) = outcome.as_error() {
                        aggregate.fail(error);
                        return;
                    }
                    if let Some(value) = outcome.success() {
                        values.push(value.clone());
                    }
                }
                aggregate.resolve(values);
            });
        }

        let entrants = Arc::clone(&entrants);
        aggregate.on_cancel(move || {
            for entrant in entrants.iter() {
                entrant.cancel();
            }
        });
        aggregate
    }

    /// Races this promise against a timer that fails with
    /// [`PromiseError::TimedOut`] after `duration`.
    ///
    /// Requires a tokio runtime for the timer task.
    pub fn with_timeout(&self, duration: Duration) -> Promise<T> {
        let timer: Promise<T> = Promise::pending();
        let deadline = timer.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            deadline.fail(PromiseError::TimedOut(duration));
        });
        timer.on_cancel(move || handle.abort());
        Promise::race(vec![self.clone(), timer])
    }

    /// Invokes `producer` until its promise succeeds or
    /// [`RetryConfig::attempts`] are exhausted, sleeping
    /// [`RetryConfig::delay`] between attempts.
    ///
    /// Cancelling the returned promise cancels the in-flight attempt and
    /// stops further retries. A cancelled attempt is not retried.
    ///
    /// Requires a tokio runtime for the delay timer.
    pub fn retrying(
        config: RetryConfig,
        producer: impl FnMut() -> Promise<T> + Send + 'static,
    ) -> Promise<T> {
        let aggregate: Promise<T> = Promise::pending();
        let current: Arc<Mutex<Option<Promise<T>>>> = Arc::new(Mutex::new(None));

        Self::attempt(
            config,
            Box::new(producer),
            aggregate.clone(),
            Arc::clone(&current),
            1,
        );

        aggregate.on_cancel(move || {
            if let Some(attempt) = lock_slot(&current).take() {
                attempt.cancel();
            }
        });
        aggregate
    }

    fn attempt(
        config: RetryConfig,
        mut producer: Box<dyn FnMut() -> Promise<T> + Send>,
        aggregate: Promise<T>,
        current: Arc<Mutex<Option<Promise<T>>>>,
        attempt_no: u32,
    ) {
        let attempt = producer();
        *lock_slot(&current) = Some(attempt.clone());

        attempt.on_completion(&Queue::inline(), move |outcome| match &*outcome {
            Outcome::Success(_) | Outcome::Cancelled => {
                aggregate.settle_shared(outcome);
            }
            Outcome::Failure(error) => {
                if attempt_no >= config.attempts || aggregate.is_settled() {
                    aggregate.fail(error.clone());
                    return;
                }
                debug!(attempt = attempt_no, error = %error, "attempt failed, retrying");
                let delay = config.delay;
                tokio::spawn(async move {
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                    Self::attempt(config, producer, aggregate, current, attempt_no + 1);
                });
            }
        });
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = match &*guard {
            State::Pending { .. } => "pending",
            State::Settled(outcome) => match &**outcome {
                Outcome::Success(_) => "succeeded",
                Outcome::Failure(_) => "failed",
                Outcome::Cancelled => "cancelled",
            },
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

fn lock_slot<T>(slot: &Arc<Mutex<Option<Promise<T>>>>) -> MutexGuard<'_, Option<Promise<T>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Renders a caught panic payload as text for [`PromiseError::Panicked`].
pub(crate) fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
