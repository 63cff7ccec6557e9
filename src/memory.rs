//! In-process implementations of the backend seams. They make a single-process deployment possible and are what
//! the test suite runs against.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::clock::millis;
use crate::error::CacheError;
use crate::error::Result;
use crate::traits::Broadcast;
use crate::traits::ChangeQueue;
use crate::traits::ChangeStream;
use crate::traits::Clock;
use crate::traits::Delivery;
use crate::traits::KvStore;
use crate::traits::MessageStream;
use crate::traits::RowChange;
use crate::types::ChangeOperation;

#[derive(Debug)]
struct StoredValue {
    value:      String,
    expires_at: Option<i64>,
}

impl StoredValue {
    #[inline]
    fn alive(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// A [`KvStore`] over a concurrent hash map. TTLs follow the given clock.
#[derive(Debug)]
pub struct MemoryStore {
    data:    DashMap<String, StoredValue>,
    clock:   Arc<dyn Clock>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: DashMap::new(),
            clock,
            offline: AtomicBool::new(false),
        }
    }

    /// Make every operation fail, as if the store became unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.data.iter().filter(|e| e.value().alive(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CacheError::store("memory store is offline"))
        }
        else {
            Ok(())
        }
    }

    fn stored(&self, value: &str, ttl: Option<Duration>) -> StoredValue {
        StoredValue {
            value:      value.to_string(),
            expires_at: ttl.map(|ttl| self.clock.now_millis() + millis(ttl)),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        let now = self.clock.now_millis();
        if let Some(stored) = self.data.get(key) {
            if stored.alive(now) {
                return Ok(Some(stored.value.clone()));
            }
        }
        else {
            return Ok(None);
        }
        self.data.remove_if(key, |_, stored| !stored.alive(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_online()?;
        self.data.insert(key.to_string(), self.stored(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let now = self.clock.now_millis();
        let stored = self.stored(value, Some(ttl));
        Ok(match self.data.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().alive(now) {
                    false
                }
                else {
                    entry.insert(stored);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(stored);
                true
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        let now = self.clock.now_millis();
        Ok(self.data.remove(key).is_some_and(|(_, stored)| stored.alive(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_online()?;
        let now = self.clock.now_millis();
        Ok(self
            .data
            .remove_if(key, |_, stored| stored.alive(now) && stored.value == expected)
            .is_some())
    }
}

/// Process-local [`Broadcast`]. Suitable when all nodes share one process, like in tests.
#[derive(Debug)]
pub struct LocalBroadcast {
    topics:   DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LocalBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics:   DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// End all current subscriptions of a topic.
    pub fn close_topic(&self, topic: &str) {
        self.topics.remove(topic);
    }
}

#[async_trait]
impl Broadcast for LocalBroadcast {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        // No subscribers is not an error for a fan-out channel.
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        let topic = topic.to_string();
        let receiver = self.sender(&topic).subscribe();
        Ok(Box::pin(BroadcastStream::new(receiver).filter_map(move |msg| match msg {
            Ok(payload) => Some(payload),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(topic = %topic, skipped, "subscriber lagged behind, messages lost");
                None
            }
        })))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    payloads:      Vec<String>,
    acked:         Vec<bool>,
    first_unacked: usize,
}

/// Durable-queue stand-in. Offsets are positions in the queue.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state:   Mutex<QueueState>,
    offline: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of messages not acknowledged yet.
    pub fn unacked(&self) -> usize {
        self.state.lock().acked.iter().filter(|acked| !**acked).count()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CacheError::feed("memory queue is offline"))
        }
        else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChangeQueue for MemoryQueue {
    type Offset = u64;

    async fn push(&self, payload: String) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.payloads.push(payload);
        state.acked.push(false);
        Ok(())
    }

    async fn fetch(&self, max: usize) -> Result<Vec<Delivery<u64>>> {
        self.check_online()?;
        let state = self.state.lock();
        Ok((state.first_unacked..state.payloads.len())
            .filter(|idx| !state.acked[*idx])
            .take(max)
            .map(|idx| Delivery {
                offset:  idx as u64,
                payload: state.payloads[idx].clone(),
            })
            .collect())
    }

    async fn ack(&self, offset: &u64) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        let idx = *offset as usize;
        if idx >= state.acked.len() {
            return Err(CacheError::feed(format!("unknown queue offset {offset}")));
        }
        state.acked[idx] = true;
        while state.first_unacked < state.acked.len() && state.acked[state.first_unacked] {
            state.first_unacked += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StreamState {
    changes:   Vec<RowChange<u64>>,
    committed: usize,
}

/// Row-change stream stand-in, fed by [`MemoryChangeStream::push_change`].
#[derive(Debug, Default)]
pub struct MemoryChangeStream {
    state: Mutex<StreamState>,
}

impl MemoryChangeStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a row change as the database would.
    pub fn push_change(&self, table: &str, operation: ChangeOperation, data: Map<String, Value>) {
        let mut state = self.state.lock();
        let position = state.changes.len() as u64;
        state.changes.push(RowChange {
            position,
            table: table.to_string(),
            operation,
            data,
        });
    }

    pub fn committed(&self) -> usize {
        self.state.lock().committed
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    type Position = u64;

    async fn poll(&self, max: usize) -> Result<Vec<RowChange<u64>>> {
        let state = self.state.lock();
        Ok(state.changes.iter().skip(state.committed).take(max).cloned().collect())
    }

    async fn commit(&self, position: &u64) -> Result<()> {
        let mut state = self.state.lock();
        state.committed = state.committed.max(*position as usize + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_store_ttl() -> Result<(), Box<dyn Error>> {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());

        store.set("a", "1", Some(Duration::from_secs(5))).await?;
        store.set("b", "2", None).await?;
        assert!(!store.set_if_absent("a", "x", Duration::from_secs(5)).await?);

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("a").await?, None);
        assert_eq!(store.get("b").await?.as_deref(), Some("2"));
        assert_eq!(store.len(), 1);
        assert!(store.set_if_absent("a", "x", Duration::from_secs(5)).await?);

        assert!(!store.delete_if_equals("a", "1").await?);
        assert!(store.delete_if_equals("a", "x").await?);

        store.set_offline(true);
        assert!(matches!(store.get("b").await, Err(CacheError::Store(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_queue_redelivers_unacked() -> Result<(), Box<dyn Error>> {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            queue.push(format!("m{i}")).await?;
        }

        let batch = queue.fetch(3).await?;
        assert_eq!(batch.iter().map(|d| d.payload.as_str()).collect::<Vec<_>>(), ["m0", "m1", "m2"]);
        queue.ack(&batch[0].offset).await?;
        queue.ack(&batch[2].offset).await?;

        let batch = queue.fetch(10).await?;
        assert_eq!(batch.iter().map(|d| d.offset).collect::<Vec<_>>(), [1, 3, 4]);
        assert_eq!(queue.unacked(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_change_stream_resumes_after_commit() -> Result<(), Box<dyn Error>> {
        let stream = MemoryChangeStream::new();
        for id in 1..=3 {
            let mut data = Map::new();
            data.insert("id".into(), Value::from(id));
            stream.push_change("shop", ChangeOperation::Update, data);
        }

        let changes = stream.poll(2).await?;
        assert_eq!(changes.len(), 2);
        stream.commit(&changes[0].position).await?;

        let changes = stream.poll(10).await?;
        assert_eq!(changes.iter().map(|c| c.position).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(stream.committed(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_broadcast_fan_out() -> Result<(), Box<dyn Error>> {
        let channel = LocalBroadcast::default();
        let mut first = channel.subscribe("cache:invalidate").await?;
        let mut second = channel.subscribe("cache:invalidate").await?;

        channel.publish("cache:invalidate", "hello".into()).await?;
        channel.publish("other", "ignored".into()).await?;
        assert_eq!(first.next().await.as_deref(), Some("hello"));
        assert_eq!(second.next().await.as_deref(), Some("hello"));

        channel.close_topic("cache:invalidate");
        assert_eq!(first.next().await, None);
        Ok(())
    }
}
