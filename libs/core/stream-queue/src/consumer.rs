//! Consumer engine: poller, claimer, and worker pool
//!
//! [`Consumer::listen`] runs three kinds of tasks over one bounded in-process
//! queue:
//! - a **poller** reading new messages for the consumer group;
//! - a **claimer** sweeping the pending lists on an interval and taking over
//!   deliveries other consumers abandoned;
//! - **workers** invoking handlers and deciding, per message, between
//!   acknowledge, reschedule, and dead-letter.
//!
//! Delivery is at-least-once: a message is acknowledged only after its
//! handler finishes. Handler failures and panics are reported on the errors
//! channel and never stop the engine; network failures are retried with
//! backoff; any other backend error shuts the whole consumer down.

use crate::backend::Backend;
use crate::config::ConsumerOptions;
use crate::error::QueueError;
use crate::handler::{Handler, HandlerResult};
use crate::message::Message;
use crate::retry::RetryPolicy;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Claims during the pending sweep require this much idle time, so two
/// consumers racing the same sweep cannot steal a delivery the other has
/// just taken over.
const CLAIM_MIN_IDLE: Duration = Duration::from_secs(60);

/// Reads messages from Redis streams through a consumer group and dispatches
/// them to registered handlers.
///
/// Register handlers with [`subscribe`](Consumer::subscribe) or
/// [`subscribe_with_dead_letter`](Consumer::subscribe_with_dead_letter), take
/// the errors channel with [`errors`](Consumer::errors), then call
/// [`listen`](Consumer::listen).
pub struct Consumer<B: Backend> {
    backend: B,
    opts: ConsumerOptions,
    handlers: HashMap<String, Arc<dyn Handler>>,
    dead_letter_handlers: HashMap<String, Arc<dyn Handler>>,
    errors_tx: Option<mpsc::Sender<QueueError>>,
    errors_rx: Option<mpsc::Receiver<QueueError>>,
}

impl<B: Backend> Consumer<B> {
    pub fn new(backend: B, opts: ConsumerOptions) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(1);
        Self {
            backend,
            opts,
            handlers: HashMap::new(),
            dead_letter_handlers: HashMap::new(),
            errors_tx: Some(errors_tx),
            errors_rx: Some(errors_rx),
        }
    }

    /// Take the errors channel receiver.
    ///
    /// Non-fatal failures are reported here: handler errors, handler panics,
    /// and transient network errors under retry. The channel blocks the
    /// engine while full, so the receiver must be drained promptly. It closes
    /// after [`listen`](Consumer::listen) returns. If the receiver is never
    /// taken, notifications are discarded.
    pub fn errors(&mut self) -> Option<mpsc::Receiver<QueueError>> {
        self.errors_rx.take()
    }

    /// Register the handler for a stream. Replaces any previously registered
    /// handler for the same stream.
    pub fn subscribe<H: Handler>(&mut self, stream: impl Into<String>, handler: H) {
        self.handlers.insert(stream.into(), Arc::new(handler));
    }

    /// Register a handler together with a dead-letter handler that receives
    /// messages once their retries are exhausted.
    ///
    /// # Panics
    ///
    /// Panics if a dead-letter handler is already registered for `stream`.
    pub fn subscribe_with_dead_letter<H, D>(
        &mut self,
        stream: impl Into<String>,
        handler: H,
        dead_letter: D,
    ) where
        H: Handler,
        D: Handler,
    {
        let stream = stream.into();
        if self.dead_letter_handlers.contains_key(&stream) {
            panic!("dead-letter handler already registered for stream '{stream}'");
        }
        self.handlers.insert(stream.clone(), Arc::new(handler));
        self.dead_letter_handlers.insert(stream, Arc::new(dead_letter));
    }

    /// Run the consumer until `shutdown` is cancelled or a fatal error
    /// occurs.
    ///
    /// Creates the consumer group on every subscribed stream, then runs the
    /// poller, the claimer, and `concurrency` workers. On cancellation the
    /// workers drain the in-process queue before exiting, so every message
    /// already read is either handled or left pending for reclamation.
    /// Cancellation itself returns `Ok(())`. With no handlers registered
    /// there is nothing to listen for and the call returns immediately.
    pub async fn listen(&mut self, shutdown: CancellationToken) -> Result<(), QueueError> {
        if self.handlers.is_empty() {
            warn!("No handlers registered; nothing to listen for");
            return Ok(());
        }

        let errors_tx = self
            .errors_tx
            .take()
            .ok_or_else(|| QueueError::Internal("listen may only be called once".to_string()))?;
        // If the application never took the receiver, drop it so error
        // notifications are discarded instead of blocking the engine.
        drop(self.errors_rx.take());

        let mut opts = self.opts.clone();
        if opts.pending_timeout < opts.handler_timeout {
            warn!(
                pending_timeout_ms = opts.pending_timeout.as_millis() as u64,
                handler_timeout_ms = opts.handler_timeout.as_millis() as u64,
                "Pending timeout below handler timeout; raising it to match"
            );
            opts.pending_timeout = opts.handler_timeout;
        }

        let streams: Vec<String> = self.handlers.keys().cloned().collect();
        for stream in &streams {
            match self.backend.create_group(stream, &opts.group, "$").await {
                Ok(()) => {
                    info!(stream = %stream, group = %opts.group, "Created consumer group");
                }
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream = %stream, group = %opts.group, "Consumer group already exists");
                }
                Err(e) => return Err(QueueError::from_redis(e)),
            }
        }

        let concurrency = opts.concurrency.max(1);
        let (queue_tx, queue_rx) = async_channel::bounded(opts.buffer_size.max(1));
        let (stop_tx, stop_rx) = async_channel::bounded::<()>(concurrency);

        info!(
            group = %opts.group,
            consumer = %opts.consumer,
            streams = ?streams,
            concurrency,
            "Consumer listening"
        );

        let engine = Arc::new(Engine {
            backend: self.backend.clone(),
            opts,
            handlers: self.handlers.clone(),
            dead_letter_handlers: self.dead_letter_handlers.clone(),
            queue_tx,
            queue_rx,
            errors: errors_tx,
            shutdown: shutdown.child_token(),
        });

        let mut workers: Vec<JoinHandle<Result<(), QueueError>>> = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let engine = engine.clone();
            let stop = stop_rx.clone();
            workers.push(tokio::spawn(async move {
                let result = engine.work(stop).await;
                engine.finish(result)
            }));
        }

        let poller = tokio::spawn({
            let engine = engine.clone();
            let streams = streams.clone();
            async move {
                let result = engine.poll(&streams).await;
                engine.finish(result)
            }
        });
        let claimer = tokio::spawn({
            let engine = engine.clone();
            async move {
                let result = engine.claim(&streams).await;
                engine.finish(result)
            }
        });

        let mut first_error = None;
        for task in [poller, claimer] {
            collect(task.await, &mut first_error);
        }

        // The poller and claimer are done; hand each worker a stop signal.
        // Workers drain the queue before honouring it.
        for _ in 0..concurrency {
            let _ = stop_tx.send(()).await;
        }
        for task in workers {
            collect(task.await, &mut first_error);
        }

        // Dropping the engine releases the last error-channel senders, which
        // closes the channel for the application.
        drop(engine);

        info!(group = %self.opts.group, consumer = %self.opts.consumer, "Consumer stopped");
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn collect(
    joined: Result<Result<(), QueueError>, tokio::task::JoinError>,
    first_error: &mut Option<QueueError>,
) {
    let err = match joined {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(join) => QueueError::Internal(format!("engine task failed: {join}")),
    };
    first_error.get_or_insert(err);
}

struct Engine<B: Backend> {
    backend: B,
    opts: ConsumerOptions,
    handlers: HashMap<String, Arc<dyn Handler>>,
    dead_letter_handlers: HashMap<String, Arc<dyn Handler>>,
    queue_tx: async_channel::Sender<Message>,
    queue_rx: async_channel::Receiver<Message>,
    errors: mpsc::Sender<QueueError>,
    shutdown: CancellationToken,
}

enum Invocation {
    Completed(HandlerResult),
    Panicked(String),
}

impl<B: Backend> Engine<B> {
    /// Normalise a task result: cancellation is a clean exit, anything else
    /// is fatal and tears the remaining tasks down.
    fn finish(&self, result: Result<(), QueueError>) -> Result<(), QueueError> {
        match result {
            Ok(()) | Err(QueueError::Cancelled) => Ok(()),
            Err(err) => {
                error!(error = %err, "Engine task failed; shutting down");
                self.shutdown.cancel();
                Err(err)
            }
        }
    }

    /// Read new messages for the group and feed them to the workers.
    async fn poll(&self, streams: &[String]) -> Result<(), QueueError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let count = self.read_count();
            let pages = self
                .retry(|| {
                    self.backend.read_group(
                        &self.opts.group,
                        &self.opts.consumer,
                        streams,
                        count,
                        Some(self.opts.read_timeout),
                    )
                })
                .await?;

            for page in pages {
                for entry in page.entries {
                    self.enqueue(Message {
                        id: entry.id,
                        stream: page.stream.clone(),
                        values: entry.values,
                        retry_count: 0,
                    })
                    .await?;
                }
            }
        }
    }

    /// Sweep the pending lists on an interval, taking over deliveries that
    /// other consumers abandoned. A zero interval disables claiming in this
    /// consumer.
    async fn claim(&self, streams: &[String]) -> Result<(), QueueError> {
        if self.opts.claim_interval.is_zero() {
            debug!("Claim interval is zero; not claiming abandoned messages");
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(QueueError::Cancelled),
                _ = tokio::time::sleep(self.opts.claim_interval) => {}
            }
            for stream in streams {
                self.claim_stream(stream).await?;
            }
        }
    }

    /// Page through one stream's pending list from the beginning, claiming
    /// entries that another consumer has left idle past the pending timeout.
    async fn claim_stream(&self, stream: &str) -> Result<(), QueueError> {
        let mut start = "-".to_string();
        loop {
            if self.shutdown.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let count = self.read_count();
            let pending = self
                .retry(|| {
                    self.backend
                        .pending(stream, &self.opts.group, &start, "+", count)
                })
                .await?;
            let Some(last) = pending.last() else {
                return Ok(());
            };
            // Advance past everything seen this page, including entries we
            // skip: the list is ID-ordered, not idle-ordered, so stopping at
            // a young entry would strand older ones behind it.
            let next_start = increment_message_id(&last.id)?;

            let mut candidates = Vec::new();
            let mut delivery_counts = HashMap::new();
            for entry in &pending {
                if entry.consumer == self.opts.consumer {
                    continue;
                }
                if entry.idle < self.opts.pending_timeout {
                    continue;
                }
                candidates.push(entry.id.clone());
                // The pre-claim counter: deliveries before the one our claim
                // is about to make.
                delivery_counts.insert(entry.id.clone(), entry.delivery_count);
            }

            if !candidates.is_empty() {
                let claimed = self
                    .retry(|| {
                        self.backend.claim(
                            stream,
                            &self.opts.group,
                            &self.opts.consumer,
                            CLAIM_MIN_IDLE,
                            &candidates,
                        )
                    })
                    .await?;
                if !claimed.is_empty() {
                    info!(stream = %stream, count = claimed.len(), "Claimed abandoned messages");
                }
                for entry in claimed {
                    let retry_count = delivery_counts.get(&entry.id).copied().unwrap_or(0);
                    self.enqueue(Message {
                        id: entry.id,
                        stream: stream.to_string(),
                        values: entry.values,
                        retry_count,
                    })
                    .await?;
                }
            }

            start = next_start;
        }
    }

    /// Process messages until a stop signal arrives and the queue is empty.
    async fn work(&self, stop: async_channel::Receiver<()>) -> Result<(), QueueError> {
        loop {
            tokio::select! {
                biased;
                message = self.queue_rx.recv() => match message {
                    Ok(message) => self.process(message).await?,
                    Err(_) => return Ok(()),
                },
                _ = stop.recv() => return Ok(()),
            }
        }
    }

    /// Handle one delivery and settle it: acknowledge on success or discard,
    /// reschedule on retryable failure or panic.
    async fn process(&self, message: Message) -> Result<(), QueueError> {
        debug!(
            stream = %message.stream,
            id = %message.id,
            retry_count = message.retry_count,
            "Processing message"
        );

        let exhausted = self.opts.max_retry >= 0 && message.retry_count > self.opts.max_retry;
        let handler = if exhausted {
            self.dead_letter_handlers.get(&message.stream)
        } else {
            self.handlers.get(&message.stream)
        };
        let Some(handler) = handler else {
            // Retries exhausted with no dead-letter handler registered:
            // acknowledge so the message stops cycling.
            warn!(
                stream = %message.stream,
                id = %message.id,
                retry_count = message.retry_count,
                "No handler for delivery; acknowledging"
            );
            return self.ack(&message).await;
        };

        match self.invoke(handler.clone(), &message).await {
            Invocation::Completed(HandlerResult::Success) => {
                self.ack(&message).await?;
            }
            Invocation::Completed(HandlerResult::Retry { error, backoff }) => {
                warn!(
                    stream = %message.stream,
                    id = %message.id,
                    error = %error,
                    "Handler failed; rescheduling"
                );
                self.reschedule(&message, backoff).await?;
                self.notify(QueueError::Handler {
                    message,
                    source: error,
                })
                .await?;
            }
            Invocation::Completed(HandlerResult::Discard { error }) => {
                warn!(
                    stream = %message.stream,
                    id = %message.id,
                    error = %error,
                    "Handler failed; discarding"
                );
                self.ack(&message).await?;
                self.notify(QueueError::Handler {
                    message,
                    source: error,
                })
                .await?;
            }
            Invocation::Panicked(panic) => {
                error!(
                    stream = %message.stream,
                    id = %message.id,
                    panic = %panic,
                    "Handler panicked; rescheduling"
                );
                self.reschedule(&message, None).await?;
                self.notify(QueueError::HandlerPanic { message, panic }).await?;
            }
        }

        Ok(())
    }

    /// Invoke the handler behind a panic barrier, with a cancellation token
    /// that fires on shutdown or when the handler timeout elapses. The
    /// handler future is awaited to completion either way.
    async fn invoke(&self, handler: Arc<dyn Handler>, message: &Message) -> Invocation {
        let ctx = self.shutdown.child_token();
        if !self.opts.handler_timeout.is_zero() {
            let deadline = ctx.clone();
            let completed = ctx.clone();
            let timeout = self.opts.handler_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = completed.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => deadline.cancel(),
                }
            });
        }

        let fut = handler.handle_event(ctx.clone(), message.clone());
        let invocation = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => Invocation::Completed(result),
            Err(panic) => Invocation::Panicked(panic_message(panic)),
        };
        // Releases the deadline task if it is still waiting.
        ctx.cancel();
        invocation
    }

    /// Take the message back onto this consumer's own pending list after a
    /// backoff, refresh its retry count from the pending list, and requeue it.
    async fn reschedule(&self, message: &Message, backoff: Option<Duration>) -> Result<(), QueueError> {
        let delay = backoff.unwrap_or_else(|| self.opts.backoff.for_attempt(message.retry_count));
        debug!(
            stream = %message.stream,
            id = %message.id,
            delay_ms = delay.as_millis() as u64,
            "Rescheduling message"
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => return Err(QueueError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        // Self-claim: resets the idle clock so other consumers keep treating
        // the delivery as active, and bumps the delivery counter.
        let ids = [message.id.clone()];
        let claimed = self
            .retry(|| {
                self.backend.claim(
                    &message.stream,
                    &self.opts.group,
                    &self.opts.consumer,
                    Duration::ZERO,
                    &ids,
                )
            })
            .await?;
        let [entry] = <[_; 1]>::try_from(claimed).map_err(|_| QueueError::Reclaim {
            stream: message.stream.clone(),
            id: message.id.clone(),
        })?;

        let pending = self
            .retry(|| {
                self.backend
                    .pending(&message.stream, &self.opts.group, &message.id, &message.id, 1)
            })
            .await?;
        let [info] = <[_; 1]>::try_from(pending).map_err(|_| QueueError::Reclaim {
            stream: message.stream.clone(),
            id: message.id.clone(),
        })?;

        // The counter includes the delivery our claim just made; the retry
        // count is the deliveries before it.
        self.enqueue(Message {
            id: entry.id,
            stream: message.stream.clone(),
            values: entry.values,
            retry_count: (info.delivery_count - 1).max(0),
        })
        .await
    }

    async fn ack(&self, message: &Message) -> Result<(), QueueError> {
        let acked = self
            .retry(|| self.backend.ack(&message.stream, &self.opts.group, &message.id))
            .await?;
        debug!(stream = %message.stream, id = %message.id, acked, "Acknowledged message");
        Ok(())
    }

    async fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(QueueError::Cancelled),
            sent = self.queue_tx.send(message) => {
                sent.map_err(|_| QueueError::Internal("message queue closed".to_string()))
            }
        }
    }

    async fn notify(&self, err: QueueError) -> Result<(), QueueError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(QueueError::Cancelled),
            _ = self.errors.send(err) => Ok(()),
        }
    }

    /// Batch size for reads and pending sweeps: the room left in the queue,
    /// floored at one so the engine always makes progress.
    fn read_count(&self) -> usize {
        self.opts
            .buffer_size
            .saturating_sub(self.queue_tx.len())
            .max(1)
    }

    async fn retry<F, Fut, T>(&self, op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        RetryPolicy {
            backoff: &self.opts.backoff,
            max_retries: self.opts.network_retry,
            errors: Some(&self.errors),
            shutdown: &self.shutdown,
        }
        .run(op)
        .await
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The smallest stream ID strictly greater than `id`, used to page through
/// pending lists without revisiting the last entry.
fn increment_message_id(id: &str) -> Result<String, QueueError> {
    let malformed = || QueueError::MalformedId { id: id.to_string() };
    let (ms, seq) = id.split_once('-').ok_or_else(malformed)?;
    let seq: u64 = seq.parse().map_err(|_| malformed())?;
    Ok(format!("{ms}-{}", seq + 1))
}
