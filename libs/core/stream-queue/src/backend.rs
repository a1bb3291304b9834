//! Backend seam over the stream operations the queue needs
//!
//! The consumer and publisher are written against this trait so the engine
//! can be exercised hermetically with [`crate::MemoryBackend`]. The
//! production implementation is [`RedisBackend`] over a
//! `redis::aio::ConnectionManager`.

use async_trait::async_trait;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;

/// A single entry read or claimed from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub values: HashMap<String, String>,
}

/// Entries returned for one stream by a group read.
#[derive(Debug, Clone)]
pub struct StreamPage {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// One row of the pending entries list.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    /// Consumer currently owning the delivery.
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    /// Total deliveries of this entry, including the one that created it.
    pub delivery_count: i64,
}

/// Stream length capping applied on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTrim {
    /// Exact `MAXLEN n` trim.
    MaxLen(i64),
    /// Approximate `MAXLEN ~ n` trim; cheaper on the server.
    MaxLenApprox(i64),
}

/// Stream operations required by the consumer and publisher.
///
/// Methods return `RedisResult` so callers can classify network failures
/// uniformly and route them through the shared retry policy.
#[async_trait]
pub trait Backend: Clone + Send + Sync + 'static {
    /// `XGROUP CREATE <stream> <group> <start_id> MKSTREAM`. A BUSYGROUP
    /// error is surfaced as-is; callers treat it as already-created.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> RedisResult<()>;

    /// `XREADGROUP` for new messages (`>`) across `streams`, blocking up to
    /// `block`. A nil reply becomes an empty vec.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Option<Duration>,
    ) -> RedisResult<Vec<StreamPage>>;

    /// Extended `XPENDING` over `[start, end]`, at most `count` rows, for all
    /// consumers in the group.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> RedisResult<Vec<PendingEntry>>;

    /// `XCLAIM`: transfer ownership of `ids` to `consumer`, skipping entries
    /// idle for less than `min_idle`. Claimed entries get their idle time
    /// reset and their delivery counter incremented.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> RedisResult<Vec<StreamEntry>>;

    /// `XACK` a single entry; returns the number of entries acknowledged.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> RedisResult<i64>;

    /// `XADD` with optional length capping; returns the entry ID assigned by
    /// the server.
    async fn add(
        &self,
        stream: &str,
        id: &str,
        values: &HashMap<String, String>,
        trim: Option<StreamTrim>,
    ) -> RedisResult<String>;
}

type ReadGroupReply = Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>>;
type ClaimReply = Vec<(String, Vec<(String, String)>)>;
type PendingReply = Vec<(String, String, i64, i64)>;

/// Redis-backed implementation over a multiplexed connection manager.
///
/// The manager is cloned per call; clones share the underlying connection and
/// reconnect automatically.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Option<Duration>,
    ) -> RedisResult<Vec<StreamPage>> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS");
        for stream in streams {
            cmd.arg(stream);
        }
        for _ in streams {
            cmd.arg(">"); // Only new messages
        }

        let reply: ReadGroupReply = cmd.query_async(&mut conn).await?;

        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .map(|(stream, entries)| StreamPage {
                stream,
                entries: entries.into_iter().map(into_entry).collect(),
            })
            .collect())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> RedisResult<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();

        let reply: PendingReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg(end)
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms.max(0) as u64),
                delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> RedisResult<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64);
        for id in ids {
            cmd.arg(id);
        }

        let reply: ClaimReply = cmd.query_async(&mut conn).await?;
        Ok(reply.into_iter().map(into_entry).collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> RedisResult<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await
    }

    async fn add(
        &self,
        stream: &str,
        id: &str,
        values: &HashMap<String, String>,
        trim: Option<StreamTrim>,
    ) -> RedisResult<String> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        match trim {
            Some(StreamTrim::MaxLen(max)) => {
                cmd.arg("MAXLEN").arg(max);
            }
            Some(StreamTrim::MaxLenApprox(max)) => {
                cmd.arg("MAXLEN").arg("~").arg(max);
            }
            None => {}
        }
        cmd.arg(id);
        for (key, value) in values {
            cmd.arg(key).arg(value);
        }

        cmd.query_async(&mut conn).await
    }
}

fn into_entry((id, fields): (String, Vec<(String, String)>)) -> StreamEntry {
    StreamEntry {
        id,
        values: fields.into_iter().collect(),
    }
}
