//! Integration tests for consumer pipelines: framing, fan-out, adaptors,
//! and dispatcher backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use tether_async::queue::Queue;
use tether_stream::adaptor::{gather, SliceWriter};
use tether_stream::consumer::{
    AccumulatingConsumer, CallbackConsumer, CompositeConsumer, ConsumerLifecycle, DataConsumer,
};
use tether_stream::dispatch::Dispatcher;
use tether_stream::framing::LineConsumer;

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn line_consumer_frames_across_chunks_on_a_serial_queue() {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let consumer = LineConsumer::new(Queue::serial("framing"), move |frame| {
        sink.lock().unwrap().push(frame);
    });

    consumer.consume(Bytes::from_static(b"ab"));
    consumer.consume(Bytes::from_static(b"c\nde"));
    consumer.consume(Bytes::from_static(b"f\n"));
    consumer.finish();

    consumer.done().outcome().await;
    assert_eq!(
        frames.lock().unwrap().as_slice(),
        &[Bytes::from_static(b"abc"), Bytes::from_static(b"def")]
    );
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[test]
fn composite_delivers_to_children_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let a_log = log.clone();
    let a = CallbackConsumer::synchronous(move |chunk| {
        a_log.lock().unwrap().push(("a", chunk));
    });
    let b_log = log.clone();
    let b = CallbackConsumer::synchronous(move |chunk| {
        b_log.lock().unwrap().push(("b", chunk));
    });

    let composite = CompositeConsumer::new(vec![
        a.clone() as Arc<dyn ConsumerLifecycle>,
        b.clone() as Arc<dyn ConsumerLifecycle>,
    ]);

    composite.consume(Bytes::from_static(b"one"));
    composite.consume(Bytes::from_static(b"two"));

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            ("a", Bytes::from_static(b"one")),
            ("b", Bytes::from_static(b"one")),
            ("a", Bytes::from_static(b"two")),
            ("b", Bytes::from_static(b"two")),
        ]
    );
}

#[test]
fn composite_completes_only_after_every_child_has_ended() {
    let a = CallbackConsumer::synchronous(|_| {});
    let b = AccumulatingConsumer::new();
    let composite = CompositeConsumer::new(vec![
        a.clone() as Arc<dyn ConsumerLifecycle>,
        b.clone() as Arc<dyn ConsumerLifecycle>,
    ]);

    composite.consume(Bytes::from_static(b"payload"));
    assert!(!composite.done().is_settled());

    composite.finish();

    assert!(a.done().is_settled());
    assert!(b.done().is_settled());
    assert!(composite.done().is_settled());
    assert_eq!(
        b.data().peek().unwrap().success(),
        Some(&Bytes::from_static(b"payload"))
    );
}

#[test]
fn composite_forwards_end_of_stream_exactly_once() {
    let ends = Arc::new(AtomicUsize::new(0));
    let counter = ends.clone();
    let child = CallbackConsumer::synchronous(|_| {});
    // Observe the child's single completion through its promise.
    child.done().on_completion(&Queue::inline(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let composite = CompositeConsumer::new(vec![child as Arc<dyn ConsumerLifecycle>]);
    composite.finish();
    composite.finish();

    assert_eq!(ends.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Dispatcher backpressure
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_counter_returns_to_zero_after_drain() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let dispatcher = Arc::new(Dispatcher::new(Queue::serial("backpressure"), move |_| {
        // Simulate a callback that takes real time.
        std::thread::sleep(std::time::Duration::from_millis(1));
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut producers = Vec::new();
    for _ in 0..4 {
        let dispatcher = dispatcher.clone();
        producers.push(tokio::spawn(async move {
            for _ in 0..25 {
                dispatcher.submit(Bytes::from_static(b"chunk"));
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    dispatcher.drain().await;

    assert_eq!(dispatcher.pending(), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 100);
    assert!(dispatcher.is_closed());
}

#[tokio::test]
async fn consumer_completion_waits_for_queued_deliveries() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let consumer = CallbackConsumer::new(Queue::serial("completion"), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..10 {
        consumer.consume(Bytes::from_static(b"chunk"));
    }
    consumer.finish();

    consumer.done().outcome().await;
    assert_eq!(delivered.load(Ordering::SeqCst), 10);
    assert_eq!(consumer.pending(), 0);
}

// ---------------------------------------------------------------------------
// Adaptors feeding pipelines
// ---------------------------------------------------------------------------

#[test]
fn slice_writer_feeds_a_framing_pipeline() {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let lines = LineConsumer::new(Queue::inline(), move |frame| {
        sink.lock().unwrap().push(frame);
    });
    let writer = SliceWriter::new(lines);

    // A producer reusing one scratch buffer across writes.
    let mut scratch = [0u8; 8];
    for (text, len) in [(&b"GET /a\n"[..], 7), (&b"GET /b\n"[..], 7)] {
        scratch[..len].copy_from_slice(text);
        writer.write(&scratch[..len]);
    }
    writer.finish();

    assert_eq!(
        frames.lock().unwrap().as_slice(),
        &[Bytes::from_static(b"GET /a"), Bytes::from_static(b"GET /b")]
    );
}

#[test]
fn gathered_segments_match_streamed_accumulation() {
    let accumulator = AccumulatingConsumer::new();
    let segments = vec![
        Bytes::from_static(b"header|"),
        Bytes::from_static(b"body|"),
        Bytes::from_static(b"trailer"),
    ];

    for segment in &segments {
        accumulator.consume(segment.clone());
    }
    accumulator.finish();

    let streamed = accumulator.data().peek().unwrap();
    assert_eq!(streamed.success(), Some(&gather(segments)));
}
