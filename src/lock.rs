use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::traits::KvStore;

/// Proof of holding a rebuild lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    key:    String,
    holder: String,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// Cluster-wide per-key mutual exclusion with a lease. Acquisition never waits.
pub struct RebuildLock {
    kv:    Arc<dyn KvStore>,
    lease: Duration,
}

impl RebuildLock {
    pub fn new(kv: Arc<dyn KvStore>, lease: Duration) -> Self {
        Self { kv, lease }
    }

    pub fn lock_key(key: &str) -> String {
        format!("lock:{key}")
    }

    /// `None` if somebody else holds the lock.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockLease>> {
        let lease = LockLease {
            key:    Self::lock_key(key),
            holder: Uuid::new_v4().to_string(),
        };
        if self.kv.set_if_absent(&lease.key, &lease.holder, self.lease).await? {
            debug!(key, holder = %lease.holder, "rebuild lock acquired");
            Ok(Some(lease))
        }
        else {
            Ok(None)
        }
    }

    /// Release the lock unless the lease has expired and it now belongs to somebody else. Returns `false` in the
    /// latter case.
    pub async fn release(&self, lease: LockLease) -> Result<bool> {
        self.kv.delete_if_equals(&lease.key, &lease.holder).await
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn test_holder_checked_release() -> Result<(), Box<dyn Error>> {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let kv = Arc::new(MemoryStore::new(clock.clone()));
        let lock = RebuildLock::new(kv.clone(), Duration::from_secs(10));

        let first = lock.try_acquire("cache:shop:42").await?.expect("free lock must be acquired");
        assert_eq!(first.key(), "lock:cache:shop:42");
        assert!(lock.try_acquire("cache:shop:42").await?.is_none());

        // The first holder stalls past its lease and somebody else takes over.
        clock.advance(Duration::from_secs(11));
        let second = lock.try_acquire("cache:shop:42").await?.expect("expired lock must be acquired");
        assert_ne!(first.holder(), second.holder());

        assert!(!lock.release(first).await?);
        assert_eq!(kv.get("lock:cache:shop:42").await?.as_deref(), Some(second.holder()));
        assert!(lock.release(second).await?);
        assert!(lock.try_acquire("cache:shop:42").await?.is_some());
        Ok(())
    }
}
