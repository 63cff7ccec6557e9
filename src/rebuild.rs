use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::instrument;
use tracing::warn;
use tracing::Instrument;

use crate::business::BusinessType;
use crate::error::Result;
use crate::lock::LockLease;
use crate::lock::RebuildLock;
use crate::store::DistributedStore;
use crate::store::StoreRead;
use crate::traits::Clock;
use crate::types::Loader;

/// Refreshes logically expired entries off the callers' path. At most one rebuild per key runs cluster-wide, and
/// no more than the configured number run on this node at once.
pub struct Rebuilder {
    store:   Arc<DistributedStore>,
    lock:    Arc<RebuildLock>,
    clock:   Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    tasks:   Mutex<JoinSet<()>>,
}

impl Rebuilder {
    pub fn new(store: Arc<DistributedStore>, lock: Arc<RebuildLock>, clock: Arc<dyn Clock>, workers: usize) -> Self {
        Self {
            store,
            lock,
            clock,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Try to take the key's rebuild lock and, if that succeeds, queue the rebuild. Returns whether a rebuild was
    /// queued. Never waits for the rebuild itself.
    #[instrument(level = "trace", skip(self, business, loader), fields(business = %business.code()))]
    pub async fn schedule(&self, business: Arc<BusinessType>, key: String, id: String, loader: Loader) -> Result<bool> {
        let Some(lease) = self.lock.try_acquire(&key).await?
        else {
            debug!(key = %key, "rebuild is already in progress elsewhere");
            return Ok(false);
        };

        let store = self.store.clone();
        let lock = self.lock.clone();
        let clock = self.clock.clone();
        let permits = self.permits.clone();
        let span = tracing::debug_span!("rebuild", key = %key);

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(
            async move {
                match permits.acquire_owned().await {
                    Ok(_permit) => Self::rebuild(&store, &*clock, &business, &key, id, loader).await,
                    Err(_) => debug!("worker pool is closed"),
                }
                Self::release(&lock, lease).await;
            }
            .instrument(span),
        );
        Ok(true)
    }

    async fn rebuild(
        store: &DistributedStore,
        clock: &dyn Clock,
        business: &BusinessType,
        key: &str,
        id: String,
        loader: Loader,
    ) {
        let config = business.config();
        let mode = config.expiry();

        // Someone could have refreshed the entry between the stale read and the lock acquisition.
        if let Ok(StoreRead::Logical { expire_at, .. }) = store.read(key, &mode).await {
            if expire_at > clock.now_millis() {
                debug!("entry is already fresh");
                return;
            }
        }

        let outcome = match loader(id).await {
            Ok(Some(value)) => store.write(key, &value, &mode).await,
            Ok(None) => store.write_null(key, config.null_ttl()).await,
            Err(err) => {
                warn!(error = %err, "rebuild fallback failed, the stale value stays");
                return;
            }
        };

        match outcome {
            Ok(()) => debug!("entry rebuilt"),
            Err(err) => warn!(error = %err, "failed to store rebuilt entry"),
        }
    }

    async fn release(lock: &RebuildLock, lease: LockLease) {
        match lock.release(lease).await {
            Ok(true) => (),
            Ok(false) => warn!("rebuild outlived its lock lease"),
            Err(err) => warn!(error = %err, "failed to release rebuild lock"),
        }
    }

    /// Number of rebuilds queued or running on this node.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Wait for all queued rebuilds to finish.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(outcome) = tasks.join_next().await {
            if let Err(err) = outcome {
                warn!(error = %err, "rebuild task failed");
            }
        }
    }
}
