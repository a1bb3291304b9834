//! Reliable work queues on Redis Streams
//!
//! A [`Publisher`] appends messages to streams; a [`Consumer`] reads them
//! through a consumer group and dispatches to registered handlers with
//! at-least-once delivery.
//!
//! ## Features
//!
//! - **Consumer groups**: horizontal scaling across processes
//! - **Reclamation**: deliveries abandoned by crashed consumers are claimed
//!   and reprocessed
//! - **Retries with backoff**: failed messages are redelivered on a
//!   configurable backoff curve
//! - **Dead-lettering**: messages that exhaust their retries go to a
//!   dead-letter handler
//! - **Panic containment**: a panicking handler is reported and its message
//!   rescheduled; the consumer keeps running
//! - **Network resilience**: transient Redis failures are retried
//!   transparently
//!
//! ## Example
//!
//! ```no_run
//! use stream_queue::{Consumer, ConsumerOptions, HandlerFn, HandlerResult, RedisBackend};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = RedisBackend::connect("redis://127.0.0.1/").await?;
//! let mut consumer = Consumer::new(backend, ConsumerOptions::new("readings", "worker-1"));
//!
//! consumer.subscribe("sensor.updated", HandlerFn::new(|_ctx, message| async move {
//!     println!("received {}", message.id);
//!     HandlerResult::success()
//! }));
//!
//! let mut errors = consumer.errors().expect("errors channel already taken");
//! tokio::spawn(async move {
//!     while let Some(err) = errors.recv().await {
//!         eprintln!("queue error: {err}");
//!     }
//! });
//!
//! consumer.listen(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod backoff;
mod config;
mod consumer;
mod error;
mod handler;
mod memory;
mod message;
mod publisher;
mod retry;

// Re-export main types
pub use backend::{Backend, PendingEntry, RedisBackend, StreamEntry, StreamPage, StreamTrim};
pub use backoff::Backoff;
pub use config::{ConsumerOptions, PublisherOptions};
pub use consumer::Consumer;
pub use error::{BoxError, QueueError};
pub use handler::{Handler, HandlerFn, HandlerResult};
pub use memory::MemoryBackend;
pub use message::{DATA_FIELD, Message};
pub use publisher::Publisher;
