//! Delimiter-framed consumption of a byte stream.
//!
//! A [`LineConsumer`] accumulates chunks until a terminal delimiter
//! sequence is found, then delivers each complete frame (delimiter
//! stripped) downstream, retaining any trailing partial frame for the next
//! chunk. End-of-stream flushes the remaining partial frame, if any, as a
//! final delimiter-less frame.
//!
//! Frame boundaries never depend on chunk boundaries: the chunks `"ab"`,
//! `"c\nde"`, `"f\n"` produce the frames `"abc"` and `"def"`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use tether_async::promise::Promise;
use tether_async::queue::Queue;

use crate::consumer::{ConsumerLifecycle, DataConsumer};
use crate::dispatch::Dispatcher;

/// Buffered consumer that splits the stream into delimiter-terminated
/// frames.
pub struct LineConsumer {
    dispatcher: Dispatcher,
    buffer: Mutex<BytesMut>,
    delimiter: Bytes,
    finished: AtomicBool,
    done: Promise<()>,
}

impl LineConsumer {
    /// Creates a consumer framing on `\n`, delivering frames on the given
    /// queue.
    pub fn new(queue: Queue, callback: impl Fn(Bytes) + Send + Sync + 'static) -> Arc<Self> {
        Self::with_delimiter(queue, Bytes::from_static(b"\n"), callback)
    }

    /// Creates a consumer framing on an arbitrary terminal sequence,
    /// possibly multi-byte (for example `\r\n`).
    ///
    /// # Panics
    ///
    /// Panics if the delimiter is empty, which can never frame anything.
    pub fn with_delimiter(
        queue: Queue,
        delimiter: Bytes,
        callback: impl Fn(Bytes) + Send + Sync + 'static,
    ) -> Arc<Self> {
        assert!(!delimiter.is_empty(), "frame delimiter must not be empty");
        Arc::new(LineConsumer {
            dispatcher: Dispatcher::new(queue, callback),
            buffer: Mutex::new(BytesMut::new()),
            delimiter,
            finished: AtomicBool::new(false),
            done: Promise::pending(),
        })
    }

    fn lock_buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forwards every complete frame currently in the buffer, stripped of
    /// its delimiter.
    fn flush_frames(&self, buffer: &mut BytesMut) {
        while let Some(index) = find_subsequence(buffer, &self.delimiter) {
            let mut frame = buffer.split_to(index + self.delimiter.len());
            frame.truncate(index);
            self.dispatcher.submit(frame.freeze());
        }
    }
}

impl DataConsumer for LineConsumer {
    fn consume(&self, chunk: Bytes) {
        if self.finished.load(Ordering::Acquire) {
            warn!(len = chunk.len(), "chunk after end-of-stream dropped");
            return;
        }
        let mut buffer = self.lock_buffer();
        buffer.extend_from_slice(&chunk);
        self.flush_frames(&mut buffer);
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut buffer = self.lock_buffer();
            self.flush_frames(&mut buffer);
            // A trailing partial frame is delivered without its delimiter.
            if !buffer.is_empty() {
                let remainder = buffer.split().freeze();
                self.dispatcher.submit(remainder);
            }
        }
        let done = self.done.clone();
        self.dispatcher.close_with(move || {
            done.resolve(());
        });
    }
}

impl ConsumerLifecycle for LineConsumer {
    fn done(&self) -> Promise<()> {
        self.done.clone()
    }
}

/// First index of `needle` within `haystack`, if any.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
