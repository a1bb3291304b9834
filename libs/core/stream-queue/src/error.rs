//! Queue error types and network-error classification
//!
//! Failures fall into two broad classes:
//! - **Transient network errors**: timeouts, dropped or refused connections.
//!   These are retried with exponential backoff; each retry is reported on the
//!   errors channel with `retrying: true`.
//! - **Everything else**: other Redis errors, malformed IDs, and backend
//!   inconsistencies are fatal and shut the consumer down.
//!
//! Handler failures and panics never stop the consumer; they are reported on
//! the errors channel while the message is rescheduled or discarded.

use crate::message::Message;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type carried by handler results.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Queue processing errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Network-level Redis failure. `retrying: true` values are
    /// notifications; `retrying: false` means retries were exhausted or the
    /// failure was not worth retrying.
    #[error("network error (retrying: {retrying}): {source}")]
    Network {
        #[source]
        source: redis::RedisError,
        retrying: bool,
        /// Delay before the next attempt, when one is scheduled.
        backoff: Option<Duration>,
    },

    /// Non-network Redis error (bad command, wrong type, NOGROUP). Never
    /// retried.
    #[error("redis error: {0}")]
    Redis(redis::RedisError),

    /// A handler returned a failure for this message.
    #[error("handler failed for message {id}: {source}", id = .message.id)]
    Handler {
        message: Message,
        #[source]
        source: BoxError,
    },

    /// A handler panicked while processing this message.
    #[error("handler panicked for message {id}: {panic}", id = .message.id)]
    HandlerPanic { message: Message, panic: String },

    /// A stream message ID did not have the `<ms>-<seq>` shape.
    #[error("malformed stream message id: {id}")]
    MalformedId { id: String },

    /// A self-claim or pending lookup did not return exactly one entry.
    #[error("failed to reclaim message {id} on stream {stream}")]
    Reclaim { stream: String, id: String },

    /// JSON payload encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Classify a Redis error: network failures become [`QueueError::Network`]
    /// (non-retrying), everything else [`QueueError::Redis`].
    pub fn from_redis(err: redis::RedisError) -> Self {
        if is_network_error(&err) {
            QueueError::Network {
                source: err,
                retrying: false,
                backoff: None,
            }
        } else {
            QueueError::Redis(err)
        }
    }
}

/// True when the error is a transient network failure worth retrying: the
/// connection timed out, dropped, or was refused.
pub(crate) fn is_transient(err: &redis::RedisError) -> bool {
    err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal()
}

/// True when the error happened at the network layer at all, transient or not.
pub(crate) fn is_network_error(err: &redis::RedisError) -> bool {
    is_transient(err) || err.is_io_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_error(kind: io::ErrorKind) -> redis::RedisError {
        redis::RedisError::from(io::Error::new(kind, "io failure"))
    }

    #[test]
    fn test_timeouts_and_refusals_are_transient() {
        assert!(is_transient(&io_error(io::ErrorKind::TimedOut)));
        assert!(is_transient(&io_error(io::ErrorKind::ConnectionRefused)));
    }

    #[test]
    fn test_response_errors_are_not_transient() {
        let err = redis::RedisError::from((redis::ErrorKind::Extension, "WRONGTYPE"));
        assert!(!is_transient(&err));
        assert!(!is_network_error(&err));
        assert!(matches!(QueueError::from_redis(err), QueueError::Redis(_)));
    }

    #[test]
    fn test_io_errors_classify_as_network() {
        let err = io_error(io::ErrorKind::BrokenPipe);
        assert!(is_network_error(&err));
        match QueueError::from_redis(err) {
            QueueError::Network { retrying, .. } => assert!(!retrying),
            other => panic!("expected network error, got {other}"),
        }
    }
}
