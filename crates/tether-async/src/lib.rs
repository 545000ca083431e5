//! # tether-async
//!
//! Single-resolution promises, execution queues, and scoped-resource
//! contexts: the portable concurrency core of the tether automation
//! bridge. Every command the surrounding system runs, from spawning a
//! process to relaying a byte stream, is expressed in terms of these
//! primitives.
//!
//! ## Modules
//!
//! - [`promise`] - Single-resolution result state machine and combinators
//!   (map, chain, race, join, retry, timeout)
//! - [`queue`] - Inline and serial execution queues for continuation
//!   delivery
//! - [`context`] - Resource scoping atop promises with guaranteed,
//!   exactly-once release
//! - [`error`] - The shared error type carried by failed promises
//!
//! ## Example
//!
//! ```no_run
//! use tether_async::context::Context;
//! use tether_async::promise::Promise;
//! use tether_async::queue::Queue;
//!
//! # fn open_connection() -> Promise<String> { Promise::resolved("conn".into()) }
//! #[tokio::main]
//! async fn main() {
//!     let queue = Queue::serial("service");
//!
//!     // Acquire a connection, use it, and release it no matter how the
//!     // body turns out.
//!     let result = Context::push(open_connection(), |conn| {
//!         tracing::debug!(%conn, "closing connection");
//!     })
//!     .enter(&queue, |conn, _teardown| Promise::resolved(conn.len()));
//!
//!     let outcome = result.outcome().await;
//!     println!("{outcome:?}");
//! }
//! ```

pub mod context;
pub mod error;
pub mod promise;
pub mod queue;
