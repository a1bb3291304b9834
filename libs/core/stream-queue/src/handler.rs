//! Handler contract for consumed messages
//!
//! A handler receives each delivery together with a cancellation token. The
//! token is cancelled when the consumer shuts down or when the configured
//! handler timeout elapses; handlers doing slow work should watch it. The
//! handler future itself is always awaited to completion, never dropped
//! mid-flight.

use crate::error::BoxError;
use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of handling a single message.
#[derive(Debug)]
pub enum HandlerResult {
    /// The message was processed; acknowledge it.
    Success,

    /// Processing failed; keep the message pending and redeliver it after a
    /// backoff.
    Retry {
        error: BoxError,
        /// Explicit delay before redelivery. `None` uses the consumer's
        /// backoff policy keyed on the retry count.
        backoff: Option<Duration>,
    },

    /// Processing failed in a way a retry cannot fix; acknowledge the message
    /// but report the error.
    Discard { error: BoxError },
}

impl HandlerResult {
    /// The message was processed successfully.
    pub fn success() -> Self {
        HandlerResult::Success
    }

    /// Retry the message later using the consumer's backoff policy.
    pub fn fail(error: impl Into<BoxError>) -> Self {
        HandlerResult::Retry {
            error: error.into(),
            backoff: None,
        }
    }

    /// Retry the message after an explicit delay.
    pub fn fail_with_backoff(error: impl Into<BoxError>, backoff: Duration) -> Self {
        HandlerResult::Retry {
            error: error.into(),
            backoff: Some(backoff),
        }
    }

    /// Acknowledge the message but report the error.
    pub fn discard(error: impl Into<BoxError>) -> Self {
        HandlerResult::Discard {
            error: error.into(),
        }
    }
}

/// Processes messages delivered by a [`crate::Consumer`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle_event(&self, ctx: CancellationToken, message: Message) -> HandlerResult;
}

/// Adapts an async function or closure to a [`Handler`].
///
/// ```
/// use stream_queue::{HandlerFn, HandlerResult};
///
/// let handler = HandlerFn::new(|_ctx, message| async move {
///     println!("received {}", message.id);
///     HandlerResult::success()
/// });
/// # let _ = handler;
/// ```
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> HandlerFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle_event(&self, ctx: CancellationToken, message: Message) -> HandlerResult {
        (self.f)(ctx, message).await
    }
}
