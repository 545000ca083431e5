//! Adaptors between owned-slice and zero-copy segment representations.
//!
//! Producers differ in how they hand out bytes: some own a contiguous
//! buffer they will reuse (so the consumer must copy), others hold
//! reference-counted segments that can be forwarded without copying, and
//! possibly discontiguously. These adaptors bridge the two worlds:
//!
//! - [`SliceWriter`] copies caller-owned slices into immutable,
//!   independently-owned [`Bytes`] so the forwarded chunk's validity never
//!   depends on the caller's buffer lifetime.
//! - [`write_segments`] forwards a discontiguous segment list in order
//!   without copying.
//! - [`gather`] produces a contiguous view of a segment list, copying only
//!   when the source actually is discontiguous.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::consumer::DataConsumer;

/// Bridges producers that own and reuse their buffers to a consumer
/// expecting independently-owned chunks.
pub struct SliceWriter {
    target: Arc<dyn DataConsumer>,
}

impl SliceWriter {
    pub fn new(target: Arc<dyn DataConsumer>) -> Self {
        SliceWriter { target }
    }

    /// Copies `data` into a fresh immutable buffer and forwards it. The
    /// caller is free to reuse its buffer immediately.
    pub fn write(&self, data: &[u8]) {
        self.target.consume(Bytes::copy_from_slice(data));
    }

    /// Forwards end-of-stream to the wrapped consumer.
    pub fn finish(&self) {
        self.target.finish();
    }
}

/// Forwards a possibly-discontiguous segment list to a consumer in order,
/// without copying. Empty segments are skipped.
pub fn write_segments(target: &dyn DataConsumer, segments: Vec<Bytes>) {
    for segment in segments {
        if !segment.is_empty() {
            target.consume(segment);
        }
    }
}

/// A contiguous view of a segment list.
///
/// A single segment is returned as-is (no copy); multiple segments are
/// copied into one freshly allocated buffer.
pub fn gather(segments: Vec<Bytes>) -> Bytes {
    match segments.len() {
        0 => Bytes::new(),
        1 => segments.into_iter().next().unwrap_or_default(),
        _ => {
            let total = segments.iter().map(Bytes::len).sum();
            let mut joined = BytesMut::with_capacity(total);
            for segment in &segments {
                joined.extend_from_slice(segment);
            }
            joined.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::CallbackConsumer;
    use std::sync::Mutex;

    #[test]
    fn slice_writer_owns_its_copies() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = CallbackConsumer::synchronous(move |chunk| {
            sink.lock().unwrap().push(chunk);
        });
        let writer = SliceWriter::new(consumer);

        let mut scratch = vec![b'a', b'b'];
        writer.write(&scratch);
        // Reusing the caller's buffer must not affect what was forwarded.
        scratch[0] = b'z';
        writer.write(&scratch);
        writer.finish();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Bytes::from_static(b"ab"), Bytes::from_static(b"zb")]
        );
    }

    #[test]
    fn write_segments_preserves_order_and_skips_empties() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = CallbackConsumer::synchronous(move |chunk| {
            sink.lock().unwrap().push(chunk);
        });

        write_segments(
            consumer.as_ref(),
            vec![
                Bytes::from_static(b"one"),
                Bytes::new(),
                Bytes::from_static(b"two"),
            ],
        );

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }

    #[test]
    fn gather_empty_and_single() {
        assert_eq!(gather(Vec::new()), Bytes::new());

        let single = Bytes::from_static(b"only");
        // A single segment comes back without copying.
        let gathered = gather(vec![single.clone()]);
        assert_eq!(gathered, single);
    }

    #[test]
    fn gather_copies_discontiguous_segments() {
        let gathered = gather(vec![
            Bytes::from_static(b"seg"),
            Bytes::from_static(b"men"),
            Bytes::from_static(b"ted"),
        ]);
        assert_eq!(gathered, Bytes::from_static(b"segmented"));
    }
}
