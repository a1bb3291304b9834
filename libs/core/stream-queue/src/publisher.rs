//! Stream publisher
//!
//! Appends messages to streams, optionally capping stream length, and writes
//! the server-assigned entry ID back onto the message.

use crate::backend::{Backend, StreamTrim};
use crate::config::PublisherOptions;
use crate::error::QueueError;
use crate::message::Message;
use crate::retry::RetryPolicy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Publishes messages onto streams.
pub struct Publisher<B: Backend> {
    backend: B,
    opts: PublisherOptions,
    errors_tx: mpsc::Sender<QueueError>,
    errors_rx: Option<mpsc::Receiver<QueueError>>,
}

impl<B: Backend> Publisher<B> {
    pub fn new(backend: B, opts: PublisherOptions) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(1);
        Self {
            backend,
            opts,
            errors_tx,
            errors_rx: Some(errors_rx),
        }
    }

    /// Take the errors channel receiver. Transient network errors under
    /// retry are reported here; if the receiver is never taken,
    /// notifications are discarded. Can be taken once.
    pub fn errors(&mut self) -> Option<mpsc::Receiver<QueueError>> {
        self.errors_rx.take()
    }

    /// Append `message` to its stream.
    ///
    /// An empty `message.id` asks the server to assign one; the assigned ID
    /// is written back into the message. Transient network errors are
    /// retried with backoff until `ctx` is cancelled or the retry budget is
    /// exhausted.
    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        message: &mut Message,
    ) -> Result<(), QueueError> {
        let trim = if self.opts.stream_max_length > 0 {
            Some(if self.opts.approximate_max_length {
                StreamTrim::MaxLenApprox(self.opts.stream_max_length)
            } else {
                StreamTrim::MaxLen(self.opts.stream_max_length)
            })
        } else {
            None
        };
        let id = if message.id.is_empty() {
            "*".to_string()
        } else {
            message.id.clone()
        };

        // Report retries only when somebody took the receiver.
        let errors = if self.errors_rx.is_none() {
            Some(&self.errors_tx)
        } else {
            None
        };
        let policy = RetryPolicy {
            backoff: &self.opts.backoff,
            max_retries: self.opts.network_retry,
            errors,
            shutdown: ctx,
        };

        let assigned = policy
            .run(|| self.backend.add(&message.stream, &id, &message.values, trim))
            .await?;

        debug!(stream = %message.stream, id = %assigned, "Published message");
        message.id = assigned;
        Ok(())
    }
}
