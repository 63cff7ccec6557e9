use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::Result;

/// What happened to a cached key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Update,
    Delete,
}

/// Broadcast to every node whenever a key must be dropped from local caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub operation: Operation,
    pub key:       String,
    /// Epoch milliseconds of the moment the message was produced.
    pub timestamp: i64,
}

impl InvalidationMessage {
    pub fn new<K: Into<String>>(operation: Operation, key: K, timestamp: i64) -> Self {
        Self {
            operation,
            key: key.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// How a row change is reflected in the cache: inserts and updates may bring a key into existence, deletes
    /// remove it.
    pub fn invalidation(self) -> Operation {
        match self {
            Self::Insert | Self::Update => Operation::Update,
            Self::Delete => Operation::Delete,
        }
    }
}

/// A row-level change as carried by the durable change-feed queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedMessage {
    pub table:     String,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub data:      Map<String, Value>,
}

impl ChangeFeedMessage {
    pub fn new<T: Into<String>>(table: T, operation: ChangeOperation, data: Map<String, Value>) -> Self {
        Self {
            table: table.into(),
            operation,
            data,
        }
    }

    /// The changed row identifier taken from the `id` column. Both string and numeric ids are accepted.
    pub fn row_id(&self) -> Option<String> {
        match self.data.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// How a business type's entries age in the distributed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryMode {
    /// The store drops the entry after `ttl` plus a random jitter.
    Physical { ttl: Duration },
    /// The entry carries its own expiry instant `horizon` ahead of the write and is never dropped by the store
    /// unless `retention` is set.
    Logical {
        horizon:   Duration,
        retention: Option<Duration>,
    },
}

impl ExpiryMode {
    pub fn physical(ttl: Duration) -> Self {
        Self::Physical { ttl }
    }

    pub fn logical(horizon: Duration) -> Self {
        Self::Logical {
            horizon,
            retention: None,
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, Self::Logical { .. })
    }
}

impl Default for ExpiryMode {
    fn default() -> Self {
        Self::physical(Duration::from_secs(30 * 60))
    }
}

/// A locally cached answer. `Absent` is a negative result which stops lookups from going any deeper.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Present(Arc<Value>),
    Absent,
}

impl CachedValue {
    pub fn into_option(self) -> Option<Arc<Value>> {
        match self {
            Self::Present(v) => Some(v),
            Self::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

pub type LoadFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;

/// A one-shot fallback to the system of record. It receives the entity identifier and is consumed by whichever
/// path ends up needing it: the caller's miss path or a background rebuild.
pub type Loader = Box<dyn FnOnce(String) -> LoadFuture + Send>;
