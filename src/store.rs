use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use crate::clock::millis;
use crate::error::Result;
use crate::traits::Clock;
use crate::traits::KvStore;
use crate::types::ExpiryMode;

/// Stored in place of a value when the system of record has nothing for the key.
pub const NULL_MARKER: &str = "";

#[derive(Serialize, Deserialize)]
struct LogicalEnvelope<V> {
    data:        V,
    #[serde(rename = "expireTime")]
    expire_time: i64,
}

/// What the distributed store holds for a key.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRead {
    Miss,
    Null,
    Value(Arc<Value>),
    Logical { value: Arc<Value>, expire_at: i64 },
    /// The payload can't be decoded for the business type's expiry mode.
    Corrupt(String),
}

/// Codec and expiry policy on top of a [`KvStore`].
pub struct DistributedStore {
    kv:           Arc<dyn KvStore>,
    clock:        Arc<dyn Clock>,
    jitter_ratio: f64,
}

impl DistributedStore {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, jitter_ratio: f64) -> Self {
        Self {
            kv,
            clock,
            jitter_ratio,
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn read(&self, key: &str, mode: &ExpiryMode) -> Result<StoreRead> {
        let Some(raw) = self.kv.get(key).await?
        else {
            return Ok(StoreRead::Miss);
        };
        Ok(Self::decode(&raw, mode))
    }

    fn decode(raw: &str, mode: &ExpiryMode) -> StoreRead {
        if raw == NULL_MARKER {
            return StoreRead::Null;
        }
        if mode.is_logical() {
            match serde_json::from_str::<LogicalEnvelope<Value>>(raw) {
                Ok(envelope) => StoreRead::Logical {
                    value:     Arc::new(envelope.data),
                    expire_at: envelope.expire_time,
                },
                Err(err) => StoreRead::Corrupt(err.to_string()),
            }
        }
        else {
            match serde_json::from_str::<Value>(raw) {
                Ok(value) => StoreRead::Value(Arc::new(value)),
                Err(err) => StoreRead::Corrupt(err.to_string()),
            }
        }
    }

    /// Persist a found value according to the expiry mode.
    #[instrument(level = "trace", skip(self, value))]
    pub async fn write(&self, key: &str, value: &Value, mode: &ExpiryMode) -> Result<()> {
        match *mode {
            ExpiryMode::Physical { ttl } => {
                let payload = serde_json::to_string(value)?;
                self.kv.set(key, &payload, Some(self.jittered(ttl))).await
            }
            ExpiryMode::Logical { horizon, retention } => {
                let payload = serde_json::to_string(&LogicalEnvelope {
                    data:        value,
                    expire_time: self.clock.now_millis() + millis(horizon),
                })?;
                self.kv.set(key, &payload, retention).await
            }
        }
    }

    pub async fn write_null(&self, key: &str, ttl: Duration) -> Result<()> {
        self.kv.set(key, NULL_MARKER, Some(ttl)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.kv.delete(key).await
    }

    /// `ttl` extended by a random share of up to `jitter_ratio` of itself, so that entries written together don't
    /// expire together.
    pub fn jittered(&self, ttl: Duration) -> Duration {
        let spread = (millis(ttl) as f64 * self.jitter_ratio) as u64;
        if spread == 0 {
            return ttl;
        }
        ttl + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}
