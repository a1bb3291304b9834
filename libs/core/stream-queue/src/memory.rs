//! In-memory backend for tests and development
//!
//! Implements the same consumer-group semantics the engine relies on from
//! Redis: a per-group delivery cursor, a pending entries list with owner,
//! idle clock and delivery counter, min-idle filtering on claims, and MAXLEN
//! trimming on append. Test hooks allow backdating idle times, seeding
//! deliveries owned by another consumer, and injecting one-shot errors.

use crate::backend::{Backend, PendingEntry, StreamEntry, StreamPage, StreamTrim};
use async_trait::async_trait;
use redis::{ErrorKind, RedisError, RedisResult};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

type EntryId = (u64, u64);

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    fail_next: VecDeque<RedisError>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    /// Last entry ID delivered as "new" to any consumer of the group.
    cursor: EntryId,
    pending: BTreeMap<EntryId, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    /// Test-controlled addition to the real elapsed idle time.
    idle_offset: Duration,
    delivery_count: i64,
}

impl Pending {
    fn idle(&self) -> Duration {
        self.delivered_at.elapsed() + self.idle_offset
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next backend call fail with `err`. Queued errors are consumed
    /// one per call, in order.
    pub fn fail_next(&self, err: RedisError) {
        self.lock().fail_next.push_back(err);
    }

    /// Backdate every pending entry of the group by `by`.
    pub fn advance_idle(&self, stream: &str, group: &str, by: Duration) {
        let mut state = self.lock();
        if let Some(group) = state.streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            for pending in group.pending.values_mut() {
                pending.idle_offset += by;
            }
        }
    }

    /// Record `id` as delivered to `consumer` without going through a read:
    /// the entry lands on the group's pending list with the given delivery
    /// count and idle time, and the group cursor moves past it.
    pub fn seed_pending(
        &self,
        stream: &str,
        group: &str,
        id: &str,
        consumer: &str,
        delivery_count: i64,
        idle: Duration,
    ) {
        let Some(id) = parse_id(id) else { return };
        let mut state = self.lock();
        let group = state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        group.cursor = group.cursor.max(id);
        group.pending.insert(
            id,
            Pending {
                consumer: consumer.to_string(),
                delivered_at: Instant::now(),
                idle_offset: idle,
                delivery_count,
            },
        );
    }

    /// Current pending entries of the group, in ID order.
    pub fn pending_snapshot(&self, stream: &str, group: &str) -> Vec<PendingEntry> {
        let state = self.lock();
        let Some(group) = state.streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return vec![];
        };
        group
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: format_id(*id),
                consumer: p.consumer.clone(),
                idle: p.idle(),
                delivery_count: p.delivery_count,
            })
            .collect()
    }

    /// Number of entries currently stored on the stream.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.lock().streams.get(stream).map_or(0, |s| s.entries.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(&self) -> Option<RedisError> {
        self.lock().fail_next.pop_front()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> RedisResult<()> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut state = self.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Err(RedisError::from((
                ErrorKind::Extension,
                "BUSYGROUP",
                format!("Consumer Group name already exists: '{group}'"),
            )));
        }
        let cursor = if start_id == "$" {
            stream_state.last_id
        } else {
            parse_id(start_id).unwrap_or((0, 0))
        };
        stream_state.groups.insert(
            group.to_string(),
            Group {
                cursor,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Option<Duration>,
    ) -> RedisResult<Vec<StreamPage>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let deadline = match block {
            None => None,
            Some(d) if d.is_zero() => None, // BLOCK 0 waits until data arrives
            Some(d) => Some(Instant::now() + d),
        };
        loop {
            let pages = {
                let mut state = self.lock();
                read_new(&mut state, group, consumer, streams, count)?
            };
            if !pages.is_empty() || block.is_none() {
                return Ok(pages);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(vec![]);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> RedisResult<Vec<PendingEntry>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let lo = parse_bound(start, true).ok_or_else(|| bad_id(start))?;
        let hi = parse_bound(end, false).ok_or_else(|| bad_id(end))?;

        let state = self.lock();
        let group = state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| nogroup(stream, group))?;

        Ok(group
            .pending
            .range(lo..=hi)
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: format_id(*id),
                consumer: p.consumer.clone(),
                idle: p.idle(),
                delivery_count: p.delivery_count,
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
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let Stream { entries, groups, .. } = stream_state;
        let group = groups.get_mut(group).ok_or_else(|| nogroup(stream, group))?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(id) = parse_id(id) else { continue };
            let Some(pending) = group.pending.get_mut(&id) else {
                continue;
            };
            if pending.idle() < min_idle {
                continue;
            }
            let Some(values) = entries.get(&id) else {
                // Entry was trimmed away; drop the dangling pending row.
                group.pending.remove(&id);
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = Instant::now();
            pending.idle_offset = Duration::ZERO;
            pending.delivery_count += 1;
            claimed.push(StreamEntry {
                id: format_id(id),
                values: values.clone(),
            });
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> RedisResult<i64> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let Some(id) = parse_id(id) else {
            return Err(bad_id(id));
        };
        let mut state = self.lock();
        let group = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| nogroup(stream, group))?;
        Ok(if group.pending.remove(&id).is_some() { 1 } else { 0 })
    }

    async fn add(
        &self,
        stream: &str,
        id: &str,
        values: &HashMap<String, String>,
        trim: Option<StreamTrim>,
    ) -> RedisResult<String> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut state = self.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();

        let id = if id.is_empty() || id == "*" {
            next_id(stream_state.last_id)
        } else {
            let id = parse_id(id).ok_or_else(|| bad_id(id))?;
            if id <= stream_state.last_id {
                return Err(RedisError::from((
                    ErrorKind::Extension,
                    "ERR",
                    "The ID specified in XADD is equal or smaller than the target stream top item"
                        .to_string(),
                )));
            }
            id
        };

        stream_state.last_id = id;
        stream_state.entries.insert(id, values.clone());

        if let Some(StreamTrim::MaxLen(max) | StreamTrim::MaxLenApprox(max)) = trim {
            let max = max.max(0) as usize;
            while stream_state.entries.len() > max {
                let oldest = *stream_state
                    .entries
                    .keys()
                    .next()
                    .unwrap_or(&stream_state.last_id);
                stream_state.entries.remove(&oldest);
            }
        }

        Ok(format_id(id))
    }
}

fn read_new(
    state: &mut State,
    group: &str,
    consumer: &str,
    streams: &[String],
    count: usize,
) -> RedisResult<Vec<StreamPage>> {
    let mut pages = Vec::new();
    for stream_name in streams {
        let stream_state = state
            .streams
            .get_mut(stream_name)
            .ok_or_else(|| nogroup(stream_name, group))?;
        let Stream { entries, groups, .. } = stream_state;
        let group = groups
            .get_mut(group)
            .ok_or_else(|| nogroup(stream_name, group))?;

        let ids: Vec<EntryId> = entries
            .range((Excluded(group.cursor), Unbounded))
            .take(count)
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            continue;
        }

        let mut page = Vec::with_capacity(ids.len());
        for id in ids {
            group.cursor = id;
            group.pending.insert(
                id,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    idle_offset: Duration::ZERO,
                    delivery_count: 1,
                },
            );
            page.push(StreamEntry {
                id: format_id(id),
                values: entries[&id].clone(),
            });
        }
        pages.push(StreamPage {
            stream: stream_name.clone(),
            entries: page,
        });
    }
    Ok(pages)
}

fn next_id(last: EntryId) -> EntryId {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    if now_ms > last.0 {
        (now_ms, 0)
    } else {
        (last.0, last.1 + 1)
    }
}

fn parse_id(id: &str) -> Option<EntryId> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

fn parse_bound(id: &str, is_start: bool) -> Option<EntryId> {
    match id {
        "-" => Some((0, 0)),
        "+" => Some((u64::MAX, u64::MAX)),
        _ if id.contains('-') => parse_id(id),
        _ => {
            let ms: u64 = id.parse().ok()?;
            Some(if is_start { (ms, 0) } else { (ms, u64::MAX) })
        }
    }
}

fn format_id((ms, seq): EntryId) -> String {
    format!("{ms}-{seq}")
}

fn nogroup(stream: &str, group: &str) -> RedisError {
    RedisError::from((
        ErrorKind::Extension,
        "NOGROUP",
        format!("No such key '{stream}' or consumer group '{group}'"),
    ))
}

fn bad_id(id: &str) -> RedisError {
    RedisError::from((
        ErrorKind::Extension,
        "ERR",
        format!("Invalid stream ID specified as stream command argument: '{id}'"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_read_puts_entries_on_the_pending_list() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", "$").await.unwrap();
        let id = backend
            .add("s", "*", &values(&[("k", "v")]), None)
            .await
            .unwrap();

        let pages = backend
            .read_group("g", "c1", &["s".to_string()], 10, None)
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].entries.len(), 1);
        assert_eq!(pages[0].entries[0].id, id);

        let pending = backend.pending_snapshot("s", "g");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");
        assert_eq!(pending[0].delivery_count, 1);

        // Same read again returns nothing: the cursor moved past the entry.
        let pages = backend
            .read_group("g", "c1", &["s".to_string()], 10, None)
            .await
            .unwrap();
        assert!(pages.is_empty());
    }

    #[tokio::test]
    async fn test_ack_removes_from_pending() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", "$").await.unwrap();
        let id = backend.add("s", "*", &values(&[("k", "v")]), None).await.unwrap();
        backend
            .read_group("g", "c1", &["s".to_string()], 10, None)
            .await
            .unwrap();

        assert_eq!(backend.ack("s", "g", &id).await.unwrap(), 1);
        assert!(backend.pending_snapshot("s", "g").is_empty());
        // Second ack is a no-op.
        assert_eq!(backend.ack("s", "g", &id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_respects_min_idle_and_bumps_delivery_count() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", "$").await.unwrap();
        let id = backend.add("s", "*", &values(&[("k", "v")]), None).await.unwrap();
        backend
            .read_group("g", "c1", &["s".to_string()], 10, None)
            .await
            .unwrap();

        // Freshly delivered: a min-idle claim must not steal it.
        let claimed = backend
            .claim("s", "g", "c2", Duration::from_secs(60), &[id.clone()])
            .await
            .unwrap();
        assert!(claimed.is_empty());

        backend.advance_idle("s", "g", Duration::from_secs(120));
        let claimed = backend
            .claim("s", "g", "c2", Duration::from_secs(60), &[id.clone()])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let pending = backend.pending_snapshot("s", "g");
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
        assert!(pending[0].idle < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_maxlen_trims_oldest_entries() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend
                .add(
                    "s",
                    "*",
                    &values(&[("i", &i.to_string())]),
                    Some(StreamTrim::MaxLen(3)),
                )
                .await
                .unwrap();
        }
        assert_eq!(backend.stream_len("s"), 3);
    }

    #[tokio::test]
    async fn test_explicit_ids_must_be_monotonic() {
        let backend = MemoryBackend::new();
        backend.add("s", "5-1", &values(&[("k", "v")]), None).await.unwrap();
        assert!(backend.add("s", "5-1", &values(&[("k", "v")]), None).await.is_err());
        assert!(backend.add("s", "4-0", &values(&[("k", "v")]), None).await.is_err());
        backend.add("s", "5-2", &values(&[("k", "v")]), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_errors_surface_once() {
        let backend = MemoryBackend::new();
        backend.fail_next(RedisError::from((ErrorKind::Extension, "ERR", "boom".to_string())));
        assert!(backend.add("s", "*", &HashMap::new(), None).await.is_err());
        assert!(backend.add("s", "*", &HashMap::new(), None).await.is_ok());
    }
}
