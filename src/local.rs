use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use serde_json::Value;

use crate::clock::millis;
use crate::error::CacheError;
use crate::error::Result;
use crate::traits::Clock;
use crate::types::CachedValue;

#[derive(Debug, Clone)]
pub(crate) struct LocalEntry {
    value:      CachedValue,
    expires_at: i64,
}

impl LocalEntry {
    pub(crate) fn present(value: Arc<Value>, expires_at: i64) -> Self {
        Self {
            value: CachedValue::Present(value),
            expires_at,
        }
    }

    pub(crate) fn absent(expires_at: i64) -> Self {
        Self {
            value: CachedValue::Absent,
            expires_at,
        }
    }
}

/// Node-local front of the distributed tiers. Keeps both found values and "not found" answers for a short while.
///
/// Expiry is checked against the engine clock on every read. Moka's own TTL only makes sure forgotten entries are
/// eventually reclaimed.
#[derive(Debug)]
pub struct LocalCache {
    cache: Cache<String, LocalEntry>,
    clock: Arc<dyn Clock>,
    ttl:   Duration,
}

impl LocalCache {
    pub fn new(name: &str, capacity: u64, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Cache::builder()
                .name(name)
                .max_capacity(capacity)
                .time_to_live(ttl)
                .eviction_policy(EvictionPolicy::tiny_lfu())
                .build(),
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<CachedValue> {
        let entry = self.cache.get(key).await?;
        if entry.expires_at > self.clock.now_millis() {
            Some(entry.value)
        }
        else {
            self.cache.invalidate(key).await;
            None
        }
    }

    pub async fn put(&self, key: &str, value: Arc<Value>) {
        let expires_at = self.clock.now_millis() + millis(self.ttl);
        self.cache
            .insert(key.to_string(), LocalEntry::present(value, expires_at))
            .await;
    }

    /// Remember that `key` doesn't exist. The marker never outlives the regular local TTL.
    pub async fn put_absent(&self, key: &str, ttl: Duration) {
        let expires_at = self.clock.now_millis() + millis(ttl.min(self.ttl));
        self.cache.insert(key.to_string(), LocalEntry::absent(expires_at)).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    /// Load a missing key with `init`. Concurrent loads of the same key within this process share one `init` run.
    pub(crate) async fn get_or_try_load<F>(&self, key: &str, init: F) -> Result<CachedValue>
    where
        F: Future<Output = Result<LocalEntry>>,
    {
        self.cache
            .try_get_with(key.to_string(), init)
            .await
            .map(|entry| entry.value)
            .map_err(CacheError::unshare)
    }
}
