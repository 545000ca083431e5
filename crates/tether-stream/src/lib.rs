//! # tether-stream
//!
//! Push-based byte consumers for the tether automation bridge. Every
//! byte-producing operation in the surrounding system (log relays, file
//! transfers, video capture) writes into a [`consumer::DataConsumer`];
//! callers pick unbuffered, framing, or fan-out implementations depending
//! on whether they need delimiter framing or multiple destinations, and
//! observe completion through the promises of
//! [`tether_async`](tether_async).
//!
//! ## Modules
//!
//! - [`dispatch`] - Queue-bound chunk delivery with a pending counter and
//!   an awaitable drain point
//! - [`consumer`] - The consumer traits plus unbuffered, fan-out, and
//!   accumulating implementations
//! - [`framing`] - Delimiter-framed (line) consumption
//! - [`adaptor`] - Bridges between owned-slice and zero-copy segment
//!   representations
//!
//! ## Example
//!
//! ```
//! use bytes::Bytes;
//! use tether_async::queue::Queue;
//! use tether_stream::consumer::DataConsumer;
//! use tether_stream::framing::LineConsumer;
//!
//! let lines = LineConsumer::new(Queue::inline(), |frame| {
//!     println!("line: {:?}", frame);
//! });
//! lines.consume(Bytes::from_static(b"hello\nwor"));
//! lines.consume(Bytes::from_static(b"ld\n"));
//! lines.finish();
//! ```

pub mod adaptor;
pub mod consumer;
pub mod dispatch;
pub mod framing;
