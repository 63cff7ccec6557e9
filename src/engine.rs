use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use fieldx_plus::child_build;
use fieldx_plus::fx_plus;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use crate::bus::InvalidationBus;
use crate::business::BusinessRegistry;
use crate::business::BusinessType;
use crate::clock::millis;
use crate::clock::SystemClock;
use crate::config::EngineConfig;
use crate::error::CacheError;
use crate::error::Result;
use crate::existence::ExistenceFilters;
use crate::existence::FilterStats;
use crate::feed::ChangeFeedConsumer;
use crate::listener::InvalidationListener;
use crate::local::LocalCache;
use crate::local::LocalEntry;
use crate::lock::RebuildLock;
use crate::rebuild::Rebuilder;
use crate::store::DistributedStore;
use crate::store::StoreRead;
use crate::traits::Broadcast;
use crate::traits::ChangeQueue;
use crate::traits::Clock;
use crate::traits::KvStore;
use crate::types::CachedValue;
use crate::types::InvalidationMessage;
use crate::types::Loader;
use crate::types::Operation;

/// The layered cache of one node.
///
/// A lookup goes through the local cache, the existence filter of the business type, the distributed store and,
/// finally, the fallback to the system of record. Every tier passed on the way down is populated on the way back.
///
/// ```ignore
/// let engine = CacheEngine::builder()
///     .registry(registry)
///     .config(config)
///     .kv(store)
///     .channel(broadcast)
///     .build()?;
/// engine.start().await?;
///
/// let shop: Option<Shop> = engine
///     .resolve("shop", 42, |id| async move { shops.find(&id).await })
///     .await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`CacheEngine`].", "", "See [`CacheEngine::builder()`] method."),
        method_doc("Implement builder pattern for [`CacheEngine`]."),
    )
)]
pub struct CacheEngine {
    #[fieldx(builder(required), get(clone))]
    registry: Arc<BusinessRegistry>,

    #[fieldx(builder(required), get(clone))]
    config: Arc<EngineConfig>,

    /// The shared key-value store.
    #[fieldx(builder(required), get(clone))]
    kv: Arc<dyn KvStore>,

    /// Transport of the invalidation bus.
    #[fieldx(builder(required), get(clone))]
    channel: Arc<dyn Broadcast>,

    #[fieldx(get(clone), default(Arc::new(SystemClock) as Arc<dyn Clock>))]
    clock: Arc<dyn Clock>,

    /// Node name. Most useful for logging.
    #[fieldx(get(clone), builder(into), default(String::from("cache-shield")))]
    name: String,

    #[fieldx(lazy, get(clone), builder(off))]
    local: Arc<LocalCache>,

    #[fieldx(lazy, get(clone), builder(off))]
    filters: Arc<ExistenceFilters>,

    #[fieldx(lazy, get(clone), builder(off))]
    store: Arc<DistributedStore>,

    #[fieldx(lazy, get(clone), builder(off))]
    rebuilder: Arc<Rebuilder>,

    #[fieldx(lazy, get(clone), builder(off))]
    bus: Arc<InvalidationBus>,

    // Background tasks to be stopped by close().
    #[fieldx(lazy, private, get(clone), builder(off))]
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CacheEngine {
    fn build_local(&self) -> Arc<LocalCache> {
        let config = self.config();
        Arc::new(LocalCache::new(
            &self.name(),
            config.local_capacity(),
            config.local_ttl(),
            self.clock(),
        ))
    }

    fn build_filters(&self) -> Arc<ExistenceFilters> {
        Arc::new(ExistenceFilters::new(&self.registry()))
    }

    fn build_store(&self) -> Arc<DistributedStore> {
        Arc::new(DistributedStore::new(self.kv(), self.clock(), self.config().jitter_ratio()))
    }

    fn build_rebuilder(&self) -> Arc<Rebuilder> {
        let config = self.config();
        let lock = Arc::new(RebuildLock::new(self.kv(), config.lock_lease()));
        Arc::new(Rebuilder::new(self.store(), lock, self.clock(), config.worker_count()))
    }

    fn build_bus(&self) -> Arc<InvalidationBus> {
        Arc::new(InvalidationBus::new(
            self.channel(),
            self.config().invalidation_topic(),
            self.clock(),
        ))
    }

    fn build_tasks(&self) -> Arc<Mutex<Vec<JoinHandle<()>>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub fn business(&self, code: &str) -> Result<Arc<BusinessType>> {
        self.registry().get(code)
    }

    /// Build the existence filters, join the invalidation bus and start periodic filter rebuilds.
    pub async fn start(&self) -> Result<()> {
        let myself = self.myself().ok_or(CacheError::EngineGone)?;

        if !self.rebuild_filters().await {
            warn!(node = %self.name(), "not all existence filters could be built; they answer 'maybe' until rebuilt");
        }

        let listener = child_build!(self, InvalidationListener).map_err(|err| CacheError::Build(err.to_string()))?;
        let subscription = self.bus().subscribe(listener).await?;
        self.track(subscription);

        if let Some(interval) = self.config().filter_rebuild_interval() {
            let engine = Arc::downgrade(&myself);
            self.track(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick is immediate and filters have just been built.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(engine) = engine.upgrade()
                    else {
                        break;
                    };
                    if !engine.rebuild_filters().await {
                        warn!(node = %engine.name(), "periodic filter rebuild incomplete");
                    }
                }
            }));
        }

        info!(node = %self.name(), businesses = self.registry().len(), "cache engine started");
        Ok(())
    }

    /// Apply invalidations from a change-feed queue in the background until [`close`](Self::close).
    pub fn consume_change_feed<Q: ChangeQueue>(&self, queue: Arc<Q>) -> Result<()> {
        let myself = self.myself().ok_or(CacheError::EngineGone)?;
        self.track(Arc::new(ChangeFeedConsumer::new(myself, queue)).spawn());
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        let tasks = self.tasks();
        let mut tasks = tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Stop background tasks and wait for queued rebuilds.
    pub async fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks().lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.rebuilder().drain().await;
        self.local().invalidate_all();
        debug!(node = %self.name(), "cache engine closed");
    }

    /// Resolve an entity, falling back to `fallback` when no tier has it.
    ///
    /// The fallback receives the identifier as a string. Its error is reported as
    /// [`CacheError::Unavailable`] and leaves nothing behind in any tier.
    pub async fn resolve<T, F, Fut, E>(&self, business: &str, id: impl Display, fallback: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let code = business.to_string();
        let loader: Loader = Box::new(move |id| {
            Box::pin(async move {
                match fallback(id).await {
                    Ok(Some(entity)) => Ok(Some(serde_json::to_value(entity)?)),
                    Ok(None) => Ok(None),
                    Err(err) => Err(CacheError::Lookup {
                        business: code,
                        message:  err.to_string(),
                    }),
                }
            })
        });

        let value = self.resolve_json(business, &id.to_string(), loader).await?;
        Ok(value.map(|v| T::deserialize(&*v)).transpose()?)
    }

    /// Resolve with the lookup the business type was registered with.
    pub async fn resolve_default<T: DeserializeOwned>(&self, business: &str, id: impl Display) -> Result<Option<T>> {
        let source = self.business(business)?.source().clone();
        let loader: Loader = Box::new(move |id| Box::pin(async move { source.fetch(&id).await }));
        let value = self.resolve_json(business, &id.to_string(), loader).await?;
        Ok(value.map(|v| T::deserialize(&*v)).transpose()?)
    }

    #[instrument(level = "trace", skip(self, loader))]
    pub async fn resolve_json(&self, business: &str, id: &str, loader: Loader) -> Result<Option<Arc<Value>>> {
        let bt = self.business(business)?;
        let key = bt.key_for(id);
        let local = self.local();

        if let Some(hit) = local.get(&key).await {
            trace!(key = %key, absent = hit.is_absent(), "local hit");
            return Ok(hit.into_option());
        }

        if !self.filters().might_contain(bt.code(), &key)? {
            trace!(key = %key, "rejected by existence filter");
            local.put_absent(&key, bt.config().null_ttl()).await;
            return Ok(None);
        }

        let value = local
            .get_or_try_load(&key, self.load_through(&bt, &key, id, loader))
            .await?;
        Ok(value.into_option())
    }

    // Distributed store, then the system of record. Produces what the local cache is to hold.
    async fn load_through(&self, bt: &Arc<BusinessType>, key: &str, id: &str, loader: Loader) -> Result<LocalEntry> {
        let config = bt.config();
        let mode = config.expiry();
        let store = self.store();
        let now = self.clock().now_millis();
        let local_until = now + millis(self.config().local_ttl());
        let null_until = now + millis(config.null_ttl().min(self.config().local_ttl()));

        match store.read(key, &mode).await {
            Ok(StoreRead::Miss) => (),
            Ok(StoreRead::Null) => {
                trace!(key = %key, "null marker");
                return Ok(LocalEntry::absent(null_until));
            }
            Ok(StoreRead::Value(value)) => return Ok(LocalEntry::present(value, local_until)),
            Ok(StoreRead::Logical { value, expire_at }) if expire_at > now => {
                return Ok(LocalEntry::present(value, local_until.min(expire_at)));
            }
            Ok(StoreRead::Logical { value, .. }) => {
                match self
                    .rebuilder()
                    .schedule(bt.clone(), key.to_string(), id.to_string(), loader)
                    .await
                {
                    Ok(true) => debug!(key = %key, "stale entry, rebuild scheduled"),
                    Ok(false) => trace!(key = %key, "stale entry, rebuild already running"),
                    Err(err) => warn!(key = %key, error = %err, "stale entry, couldn't schedule a rebuild"),
                }
                // Served, but not kept locally so the next read sees the rebuilt entry.
                return Ok(LocalEntry::present(value, now));
            }
            Ok(StoreRead::Corrupt(reason)) => {
                warn!(key = %key, reason = %reason, "corrupt cache entry, dropping it");
                if let Err(err) = store.delete(key).await {
                    warn!(key = %key, error = %err, "failed to drop corrupt entry");
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "distributed store unavailable, going to the system of record");
            }
        }

        match loader(id.to_string()).await {
            Ok(Some(value)) => {
                if let Err(err) = store.write(key, &value, &mode).await {
                    warn!(key = %key, error = %err, "failed to store loaded entry");
                }
                self.filters().add(bt.code(), key)?;
                Ok(LocalEntry::present(Arc::new(value), local_until))
            }
            Ok(None) => {
                if let Err(err) = store.write_null(key, config.null_ttl()).await {
                    warn!(key = %key, error = %err, "failed to store null marker");
                }
                Ok(LocalEntry::absent(null_until))
            }
            Err(err) => Err(CacheError::Unavailable {
                key:    key.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    /// Drop a key from every tier of every node. The next resolve of it goes to the system of record.
    #[instrument(level = "debug", skip(self))]
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        let bt = self.registry().business_for_key(key);
        self.drop_key(bt.as_deref(), key, Operation::Update).await
    }

    /// To be called right after the system of record was written to.
    #[instrument(level = "debug", skip(self, id), fields(id = %id))]
    pub async fn invalidate_on_write(&self, business: &str, id: impl Display, operation: Operation) -> Result<()> {
        let bt = self.business(business)?;
        let key = bt.key_for(&id.to_string());
        self.drop_key(Some(&bt), &key, operation).await
    }

    async fn drop_key(&self, bt: Option<&BusinessType>, key: &str, operation: Operation) -> Result<()> {
        // Store first, so a resolve racing with us can't refill the local cache from the old entry.
        let deleted = self.store().delete(key).await;
        self.local().invalidate(key).await;
        deleted?;
        if let Some(bt) = bt {
            self.maintain_filter(bt, key, operation)?;
        }
        self.bus().publish(operation, key).await
    }

    fn maintain_filter(&self, bt: &BusinessType, key: &str, operation: Operation) -> Result<()> {
        let filters = self.filters();
        match operation {
            Operation::Delete => filters.tombstone(bt.code(), key),
            // A write may have brought the entity into existence.
            Operation::Update => filters.add(bt.code(), key),
        }
    }

    /// Apply an invalidation received from the bus.
    pub(crate) async fn apply_invalidation(&self, message: &InvalidationMessage) {
        self.local().invalidate(&message.key).await;
        if let Some(bt) = self.registry().business_for_key(&message.key) {
            if let Err(err) = self.maintain_filter(&bt, &message.key, message.operation) {
                warn!(key = %message.key, error = %err, "filter maintenance failed");
            }
        }
        trace!(node = %self.name(), key = %message.key, operation = %message.operation, "invalidation applied");
    }

    /// `false` only if the entity certainly doesn't exist. Never fetches anything.
    pub async fn might_exist(&self, business: &str, id: impl Display) -> Result<bool> {
        let bt = self.business(business)?;
        let key = bt.key_for(&id.to_string());
        match self.local().get(&key).await {
            Some(CachedValue::Present(_)) => Ok(true),
            Some(CachedValue::Absent) => Ok(false),
            None => self.filters().might_contain(bt.code(), &key),
        }
    }

    /// Rebuild all existence filters from the system of record. `true` if every one succeeded.
    pub async fn rebuild_filters(&self) -> bool {
        self.filters().rebuild_all().await
    }

    pub async fn rebuild_filter(&self, business: &str) -> Result<bool> {
        self.filters().rebuild_one(business).await
    }

    pub fn filter_stats(&self, business: &str) -> Result<FilterStats> {
        self.filters().stats(business)
    }

    /// Number of rebuilds of logically expired entries queued or running on this node.
    pub fn rebuilds_in_flight(&self) -> usize {
        self.rebuilder().in_flight()
    }

    /// Wait until all queued rebuilds are done.
    pub async fn drain_rebuilds(&self) {
        self.rebuilder().drain().await
    }
}

