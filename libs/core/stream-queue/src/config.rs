//! Consumer and publisher configuration
//!
//! Plain structs with builder-style `with_*` methods and sensible defaults.

use crate::backoff::Backoff;
use std::time::Duration;

/// Configuration for a [`crate::Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Consumer group name. All consumers sharing a group share the work.
    pub group: String,

    /// Name of this consumer within the group. Must be unique per process;
    /// reclaimed messages are attributed to it.
    pub consumer: String,

    /// How long a blocking read waits for new messages. Also bounds shutdown
    /// latency: cancellation is observed between reads.
    pub read_timeout: Duration,

    /// Deadline for a single handler invocation; the handler's cancellation
    /// token fires when it elapses. Zero disables the deadline.
    pub handler_timeout: Duration,

    /// How long a delivery may sit unacknowledged with another consumer
    /// before this consumer's claimer takes it over. Must be at least
    /// `handler_timeout`, otherwise a message could be claimed while its
    /// handler is still running; `listen` raises it if needed.
    pub pending_timeout: Duration,

    /// Interval between pending-list sweeps. Zero disables claiming in this
    /// consumer.
    pub claim_interval: Duration,

    /// Deliveries handled by the primary handler before a message goes to
    /// the dead-letter handler. Negative means retry forever.
    pub max_retry: i64,

    /// Number of worker tasks processing messages.
    pub concurrency: usize,

    /// Capacity of the in-process message queue; also bounds read batch
    /// sizes.
    pub buffer_size: usize,

    /// Backoff policy for message redelivery and network retries.
    pub backoff: Backoff,

    /// Maximum retries for transient network errors; negative means
    /// unlimited, zero fails on the first error.
    pub network_retry: i64,
}

impl ConsumerOptions {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            read_timeout: Duration::from_secs(5),
            handler_timeout: Duration::ZERO,
            pending_timeout: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            max_retry: 3,
            concurrency: 1,
            buffer_size: 10,
            backoff: Backoff::default(),
            network_retry: 3,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }

    pub fn with_max_retry(mut self, max_retry: i64) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_network_retry(mut self, retries: i64) -> Self {
        self.network_retry = retries;
        self
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::new("workers", "worker-1")
    }
}

/// Configuration for a [`crate::Publisher`].
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Cap streams at roughly this many entries on publish. Zero disables
    /// capping.
    pub stream_max_length: i64,

    /// Use `MAXLEN ~` instead of an exact trim; cheaper on the server.
    pub approximate_max_length: bool,

    /// Backoff policy for network retries.
    pub backoff: Backoff,

    /// Maximum retries for transient network errors; negative means
    /// unlimited, zero fails on the first error.
    pub network_retry: i64,
}

impl PublisherOptions {
    pub fn new() -> Self {
        Self {
            stream_max_length: 0,
            approximate_max_length: true,
            backoff: Backoff::default(),
            network_retry: 3,
        }
    }

    pub fn with_stream_max_length(mut self, max: i64) -> Self {
        self.stream_max_length = max;
        self
    }

    pub fn with_approximate_max_length(mut self, approximate: bool) -> Self {
        self.approximate_max_length = approximate;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_network_retry(mut self, retries: i64) -> Self {
        self.network_retry = retries;
        self
    }
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults() {
        let opts = ConsumerOptions::new("readings", "worker-3");

        assert_eq!(opts.group, "readings");
        assert_eq!(opts.consumer, "worker-3");
        assert_eq!(opts.read_timeout, Duration::from_secs(5));
        assert_eq!(opts.handler_timeout, Duration::ZERO);
        assert_eq!(opts.pending_timeout, Duration::from_secs(60));
        assert_eq!(opts.claim_interval, Duration::from_secs(30));
        assert_eq!(opts.max_retry, 3);
        assert_eq!(opts.concurrency, 1);
        assert_eq!(opts.buffer_size, 10);
        assert_eq!(opts.network_retry, 3);
    }

    #[test]
    fn test_consumer_builder() {
        let opts = ConsumerOptions::new("readings", "worker-3")
            .with_read_timeout(Duration::from_millis(250))
            .with_handler_timeout(Duration::from_secs(30))
            .with_max_retry(-1)
            .with_concurrency(8)
            .with_buffer_size(64)
            .with_network_retry(0);

        assert_eq!(opts.read_timeout, Duration::from_millis(250));
        assert_eq!(opts.handler_timeout, Duration::from_secs(30));
        assert_eq!(opts.max_retry, -1);
        assert_eq!(opts.concurrency, 8);
        assert_eq!(opts.buffer_size, 64);
        assert_eq!(opts.network_retry, 0);
    }

    #[test]
    fn test_concurrency_floor() {
        let opts = ConsumerOptions::default().with_concurrency(0);
        assert_eq!(opts.concurrency, 1);
    }

    #[test]
    fn test_publisher_builder() {
        let opts = PublisherOptions::new()
            .with_stream_max_length(10_000)
            .with_approximate_max_length(false);

        assert_eq!(opts.stream_max_length, 10_000);
        assert!(!opts.approximate_max_length);
    }
}
