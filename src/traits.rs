use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use std::fmt::Debug;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

use crate::error::Result;
use crate::types::ChangeOperation;

// For types that know how to read a business type's records from the system of record.
#[async_trait]
pub trait Lookup: Send + Sync + 'static {
    /// The entity type. It's what gets serialized into the distributed store.
    type Value: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static;
    type Error: Display + Debug + Send + Sync + 'static;

    async fn lookup(&self, id: &str) -> Result<Option<Self::Value>, Self::Error>;

    /// Identifiers of all live records. Used to (re)build existence filters.
    async fn live_ids(&self) -> Result<Vec<String>, Self::Error>;

    /// A cheap estimate of the number of live records. Default implementation counts the identifiers.
    async fn estimate_count(&self) -> Result<u64, Self::Error> {
        Ok(self.live_ids().await?.len() as u64)
    }
}

/// The shared key-value store behind every node.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store a value. With `ttl` being `None` the value never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Store a value only if the key doesn't exist. Returns `true` if the value was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Atomically delete the key if it holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;
}

pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Fan-out channel: every subscriber receives every message published after it subscribed.
#[async_trait]
pub trait Broadcast: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;
    /// The subscription is active by the time this method returns.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream>;
}

#[derive(Debug, Clone)]
pub struct Delivery<O> {
    pub offset:  O,
    pub payload: String,
}

/// A durable queue with acknowledgements. Unacknowledged deliveries are handed out again by subsequent fetches,
/// including after a restart.
#[async_trait]
pub trait ChangeQueue: Send + Sync + 'static {
    type Offset: Debug + Clone + Send + Sync + 'static;

    async fn push(&self, payload: String) -> Result<()>;
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery<Self::Offset>>>;
    async fn ack(&self, offset: &Self::Offset) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowChange<P> {
    pub position:  P,
    pub table:     String,
    pub operation: ChangeOperation,
    pub data:      Map<String, Value>,
}

/// Row-level change stream of the database, e.g. a replication slot or binlog tail.
#[async_trait]
pub trait ChangeStream: Send + Sync + 'static {
    type Position: Debug + Clone + Send + Sync + 'static;

    /// Changes following the last committed position.
    async fn poll(&self, max: usize) -> Result<Vec<RowChange<Self::Position>>>;
    async fn commit(&self, position: &Self::Position) -> Result<()>;
}

/// Wall clock in epoch milliseconds. Logical expiry instants are shared between nodes, hence no monotonic clock.
pub trait Clock: Debug + Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}
