//! Push-based byte sinks with completion signaling.
//!
//! A [`DataConsumer`] accepts ordered byte chunks followed by exactly one
//! end-of-stream signal ([`finish`](DataConsumer::finish)); nothing is
//! accepted afterwards. Consumers that also expose *when* the stream has
//! fully drained implement [`ConsumerLifecycle`], whose
//! [`done`](ConsumerLifecycle::done) promise resolves once every accepted
//! chunk has been processed.
//!
//! This module provides the unbuffered [`CallbackConsumer`], the fan-out
//! [`CompositeConsumer`], and the [`AccumulatingConsumer`] that turns a
//! whole stream into one contiguous buffer. Frame-splitting lives in
//! [`crate::framing`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use tether_async::promise::Promise;
use tether_async::queue::Queue;

use crate::dispatch::Dispatcher;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An ordered byte sink with a single end-of-stream signal.
pub trait DataConsumer: Send + Sync {
    /// Accepts the next chunk of the stream.
    fn consume(&self, chunk: Bytes);

    /// Signals end-of-stream. Idempotent to call, delivered downstream
    /// exactly once; chunks consumed afterwards are dropped.
    fn finish(&self);
}

/// A consumer that reports when its stream has fully drained.
pub trait ConsumerLifecycle: DataConsumer {
    /// A promise resolving once end-of-stream has been observed and every
    /// accepted chunk has been processed.
    fn done(&self) -> Promise<()>;
}

// ---------------------------------------------------------------------------
// CallbackConsumer
// ---------------------------------------------------------------------------

/// Unbuffered consumer: every chunk is forwarded to the callback as-is
/// through a [`Dispatcher`].
pub struct CallbackConsumer {
    dispatcher: Dispatcher,
    finished: AtomicBool,
    done: Promise<()>,
}

impl CallbackConsumer {
    /// Creates a consumer delivering chunks on the given queue.
    pub fn new(queue: Queue, callback: impl Fn(Bytes) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(CallbackConsumer {
            dispatcher: Dispatcher::new(queue, callback),
            finished: AtomicBool::new(false),
            done: Promise::pending(),
        })
    }

    /// Creates a consumer whose callback runs synchronously in the caller.
    pub fn synchronous(callback: impl Fn(Bytes) + Send + Sync + 'static) -> Arc<Self> {
        Self::new(Queue::inline(), callback)
    }

    /// The number of chunks accepted but not yet processed.
    pub fn pending(&self) -> usize {
        self.dispatcher.pending()
    }
}

impl DataConsumer for CallbackConsumer {
    fn consume(&self, chunk: Bytes) {
        if self.finished.load(Ordering::Acquire) {
            warn!(len = chunk.len(), "chunk after end-of-stream dropped");
            return;
        }
        self.dispatcher.submit(chunk);
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let done = self.done.clone();
        self.dispatcher.close_with(move || {
            done.resolve(());
        });
    }
}

impl ConsumerLifecycle for CallbackConsumer {
    fn done(&self) -> Promise<()> {
        self.done.clone()
    }
}

// ---------------------------------------------------------------------------
// CompositeConsumer
// ---------------------------------------------------------------------------

/// Fan-out consumer: forwards every chunk to each child in registration
/// order, and end-of-stream to each child exactly once.
///
/// Its completion promise resolves only after every child has completed.
pub struct CompositeConsumer {
    children: Vec<Arc<dyn ConsumerLifecycle>>,
    finished: AtomicBool,
    done: Promise<()>,
}

impl CompositeConsumer {
    pub fn new(children: Vec<Arc<dyn ConsumerLifecycle>>) -> Arc<Self> {
        let completions: Vec<Promise<()>> = children.iter().map(|child| child.done()).collect();
        let done = Promise::join_all(completions).map(&Queue::inline(), |_| ());
        Arc::new(CompositeConsumer {
            children,
            finished: AtomicBool::new(false),
            done,
        })
    }
}

impl DataConsumer for CompositeConsumer {
    fn consume(&self, chunk: Bytes) {
        if self.finished.load(Ordering::Acquire) {
            warn!(len = chunk.len(), "chunk after end-of-stream dropped");
            return;
        }
        // Bytes clones share the underlying buffer, so fan-out is
        // zero-copy.
        for child in &self.children {
            child.consume(chunk.clone());
        }
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        for child in &self.children {
            child.finish();
        }
    }
}

impl ConsumerLifecycle for CompositeConsumer {
    fn done(&self) -> Promise<()> {
        self.done.clone()
    }
}

// ---------------------------------------------------------------------------
// AccumulatingConsumer
// ---------------------------------------------------------------------------

/// Collects the whole stream and yields it as one contiguous buffer at
/// end-of-stream. The bridge callers use to turn a byte stream into a
/// value.
pub struct AccumulatingConsumer {
    buffer: Mutex<BytesMut>,
    finished: AtomicBool,
    data: Promise<Bytes>,
}

impl Default for AccumulatingConsumer {
    fn default() -> Self {
        AccumulatingConsumer {
            buffer: Mutex::new(BytesMut::new()),
            finished: AtomicBool::new(false),
            data: Promise::pending(),
        }
    }
}

impl AccumulatingConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A promise resolving with the accumulated bytes at end-of-stream.
    pub fn data(&self) -> Promise<Bytes> {
        self.data.clone()
    }
}

impl DataConsumer for AccumulatingConsumer {
    fn consume(&self, chunk: Bytes) {
        if self.finished.load(Ordering::Acquire) {
            warn!(len = chunk.len(), "chunk after end-of-stream dropped");
            return;
        }
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(&chunk);
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let accumulated = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .split()
            .freeze();
        self.data.resolve(accumulated);
    }
}

impl ConsumerLifecycle for AccumulatingConsumer {
    fn done(&self) -> Promise<()> {
        self.data.map(&Queue::inline(), |_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_consumer_forwards_chunks_untouched() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = CallbackConsumer::synchronous(move |chunk| {
            sink.lock().unwrap().push(chunk);
        });

        consumer.consume(Bytes::from_static(b"ab"));
        consumer.consume(Bytes::from_static(b"c"));
        consumer.finish();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")]
        );
        assert!(consumer.done().is_settled());
    }

    #[test]
    fn finish_is_idempotent_and_blocks_later_chunks() {
        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        let consumer = CallbackConsumer::synchronous(move |_| {
            *sink.lock().unwrap() += 1;
        });

        consumer.consume(Bytes::from_static(b"x"));
        consumer.finish();
        consumer.finish();
        consumer.consume(Bytes::from_static(b"y"));

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn accumulating_consumer_yields_contiguous_bytes() {
        let consumer = AccumulatingConsumer::new();
        consumer.consume(Bytes::from_static(b"hel"));
        consumer.consume(Bytes::from_static(b"lo"));
        consumer.finish();

        let outcome = consumer.data().peek().unwrap();
        assert_eq!(outcome.success(), Some(&Bytes::from_static(b"hello")));
    }

    #[test]
    fn default_accumulating_consumer_starts_pending() {
        let consumer = AccumulatingConsumer::default();
        assert!(!consumer.data().is_settled());

        consumer.finish();
        assert_eq!(
            consumer.data().peek().unwrap().success(),
            Some(&Bytes::new())
        );
    }

    #[test]
    fn composite_with_no_children_completes_on_construction() {
        let composite = CompositeConsumer::new(Vec::new());
        assert!(composite.done().is_settled());
    }
}
