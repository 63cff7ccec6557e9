use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::bloom::BloomFilter;
use crate::business::BusinessRegistry;
use crate::business::BusinessType;
use crate::error::CacheError;
use crate::error::Result;

const MIN_CAPACITY: usize = 1024;

/// A snapshot of a filter's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    /// `false` until the first successful build. Until then the filter answers "maybe" for every key.
    pub ready:      bool,
    pub inserted:   u64,
    pub capacity:   usize,
    pub tombstones: usize,
    /// Deletions since the last rebuild or counter reset.
    pub deletes:    u64,
    pub rebuilds:   u64,
}

#[derive(Debug)]
enum PendingOp {
    Add(String),
    Delete(String),
}

#[derive(Debug)]
struct SlotState {
    bloom:      BloomFilter,
    tombstones: HashSet<String>,
    deletes:    u64,
    // Present only while a rebuild is populating a fresh filter.
    pending:    Option<Vec<PendingOp>>,
    ready:      bool,
    rebuilds:   u64,
}

#[derive(Debug)]
struct FilterSlot {
    business:   Arc<BusinessType>,
    state:      RwLock<SlotState>,
    rebuilding: AtomicBool,
}

impl FilterSlot {
    fn new(business: Arc<BusinessType>) -> Self {
        let fp_rate = business.config().false_positive_rate();
        Self {
            business,
            state: RwLock::new(SlotState {
                bloom:      BloomFilter::new(MIN_CAPACITY, fp_rate),
                tombstones: HashSet::new(),
                deletes:    0,
                pending:    None,
                ready:      false,
                rebuilds:   0,
            }),
            rebuilding: AtomicBool::new(false),
        }
    }

    fn add(&self, key: &str) {
        let mut state = self.state.write();
        state.bloom.insert(key);
        state.tombstones.remove(key);
        if let Some(pending) = state.pending.as_mut() {
            pending.push(PendingOp::Add(key.to_string()));
        }
    }

    fn might_contain(&self, key: &str) -> bool {
        let state = self.state.read();
        !state.ready || (!state.tombstones.contains(key) && state.bloom.may_contain(key))
    }

    fn bloom_contains(&self, key: &str) -> bool {
        let state = self.state.read();
        !state.ready || state.bloom.may_contain(key)
    }

    // Returns true when the delete ratio crossed the threshold.
    fn tombstone(&self, key: &str) -> bool {
        let mut state = self.state.write();
        if let Some(pending) = state.pending.as_mut() {
            pending.push(PendingOp::Delete(key.to_string()));
        }
        // Repeated deliveries of the same delete count once.
        if !state.tombstones.insert(key.to_string()) {
            return false;
        }
        state.deletes += 1;

        let ratio = state.deletes as f64 / state.bloom.inserted().max(1) as f64;
        if state.ready && ratio > self.business.config().delete_rebuild_ratio() {
            state.deletes = 0;
            return true;
        }
        false
    }

    fn stats(&self) -> FilterStats {
        let state = self.state.read();
        FilterStats {
            ready:      state.ready,
            inserted:   state.bloom.inserted(),
            capacity:   state.bloom.capacity(),
            tombstones: state.tombstones.len(),
            deletes:    state.deletes,
            rebuilds:   state.rebuilds,
        }
    }

    async fn populate(&self) -> Result<BloomFilter> {
        let business = &self.business;
        let config = business.config();
        let source = business.source();

        let estimate = source.estimate_count().await?;
        let ids = source.live_ids().await?;

        let known = estimate.max(ids.len() as u64).max(config.expected_insertions());
        let capacity = ((known as f64 * config.capacity_headroom()).ceil() as usize).max(MIN_CAPACITY);
        let mut bloom = BloomFilter::new(capacity, config.false_positive_rate());
        for id in &ids {
            bloom.insert(&business.key_for(id));
        }
        Ok(bloom)
    }

    #[instrument(level = "debug", skip(self), fields(business = %self.business.code()))]
    async fn rebuild(&self) -> bool {
        if self.rebuilding.swap(true, Ordering::AcqRel) {
            debug!("filter rebuild is already in progress");
            return false;
        }

        self.state.write().pending = Some(Vec::new());
        let outcome = self.populate().await;

        let rebuilt = {
            let mut state = self.state.write();
            let pending = state.pending.take().unwrap_or_default();
            match outcome {
                Ok(mut bloom) => {
                    // Whatever happened while the system of record was being scanned is applied on top of the scan.
                    let mut tombstones = HashSet::new();
                    for op in pending {
                        match op {
                            PendingOp::Add(key) => {
                                bloom.insert(&key);
                                tombstones.remove(&key);
                            }
                            PendingOp::Delete(key) => {
                                tombstones.insert(key);
                            }
                        }
                    }
                    debug!(
                        inserted = bloom.inserted(),
                        capacity = bloom.capacity(),
                        tombstones = tombstones.len(),
                        "filter rebuilt"
                    );
                    state.deletes = tombstones.len() as u64;
                    state.tombstones = tombstones;
                    state.bloom = bloom;
                    state.ready = true;
                    state.rebuilds += 1;
                    true
                }
                Err(err) => {
                    warn!(error = %err, "filter rebuild failed");
                    false
                }
            }
        };

        self.rebuilding.store(false, Ordering::Release);
        rebuilt
    }

    fn spawn_rebuild(self: &Arc<Self>) {
        match Handle::try_current() {
            Ok(handle) => {
                let slot = self.clone();
                handle.spawn(async move {
                    slot.rebuild().await;
                });
            }
            Err(_) => {
                warn!(business = %self.business.code(), "no async runtime, delete-triggered filter rebuild skipped");
            }
        }
    }
}

/// Per-business-type existence filters of a node.
#[derive(Debug)]
pub struct ExistenceFilters {
    slots: HashMap<String, Arc<FilterSlot>>,
}

impl ExistenceFilters {
    pub fn new(registry: &BusinessRegistry) -> Self {
        Self {
            slots: registry
                .iter()
                .map(|bt| (bt.code().to_string(), Arc::new(FilterSlot::new(bt.clone()))))
                .collect(),
        }
    }

    fn slot(&self, business: &str) -> Result<&Arc<FilterSlot>> {
        self.slots
            .get(business)
            .ok_or_else(|| CacheError::UnknownBusiness(business.to_string()))
    }

    /// Record a key as existing. Clears its tombstone, if any.
    pub fn add(&self, business: &str, key: &str) -> Result<()> {
        self.slot(business)?.add(key);
        Ok(())
    }

    /// `false` only when the key is known not to exist.
    pub fn might_contain(&self, business: &str, key: &str) -> Result<bool> {
        Ok(self.slot(business)?.might_contain(key))
    }

    /// The bare filter answer, with tombstones disregarded.
    pub fn bloom_contains(&self, business: &str, key: &str) -> Result<bool> {
        Ok(self.slot(business)?.bloom_contains(key))
    }

    /// Mark a key deleted. Too many deletions relative to the filter population start a background rebuild.
    pub fn tombstone(&self, business: &str, key: &str) -> Result<()> {
        let slot = self.slot(business)?;
        if slot.tombstone(key) {
            debug!(business, "delete ratio exceeded, rebuilding filter");
            slot.spawn_rebuild();
        }
        Ok(())
    }

    pub fn stats(&self, business: &str) -> Result<FilterStats> {
        Ok(self.slot(business)?.stats())
    }

    /// Rebuild one type's filter from the system of record. `false` if the rebuild failed or another one is
    /// already running.
    pub async fn rebuild_one(&self, business: &str) -> Result<bool> {
        Ok(self.slot(business)?.rebuild().await)
    }

    /// Rebuild every filter concurrently. `true` only if all of them succeeded.
    pub async fn rebuild_all(&self) -> bool {
        let mut rebuilds = tokio::task::JoinSet::new();
        for slot in self.slots.values() {
            let slot = slot.clone();
            rebuilds.spawn(async move { slot.rebuild().await });
        }

        let mut all_ok = true;
        while let Some(outcome) = rebuilds.join_next().await {
            match outcome {
                Ok(rebuilt) => all_ok &= rebuilt,
                Err(err) => {
                    warn!(error = %err, "filter rebuild task failed");
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::time::Duration;

    use super::*;
    use crate::config::BusinessTypeConfig;
    use crate::test::ShopLookup;

    fn filters(lookup: &ShopLookup, delete_ratio: f64) -> ExistenceFilters {
        let config = BusinessTypeConfig::builder()
            .delete_rebuild_ratio(delete_ratio)
            .build()
            .expect("business config");
        filters_with(lookup, config)
    }

    fn filters_with(lookup: &ShopLookup, config: BusinessTypeConfig) -> ExistenceFilters {
        let registry = BusinessRegistry::new()
            .register(BusinessType::new("shop", "cache:shop:", config, lookup.clone()))
            .expect("registry");
        ExistenceFilters::new(&registry)
    }

    #[tokio::test]
    async fn test_fail_open_before_first_build() -> Result<(), Box<dyn Error>> {
        let lookup = ShopLookup::with_shops(1..=10);
        let filters = filters(&lookup, 0.2);

        assert!(filters.might_contain("shop", "cache:shop:999")?);
        assert!(!filters.stats("shop")?.ready);

        assert!(filters.rebuild_all().await);
        assert!(filters.stats("shop")?.ready);
        assert!(filters.might_contain("shop", "cache:shop:5")?);
        assert!(!filters.might_contain("shop", "cache:shop:100001")?);
        assert!(matches!(filters.might_contain("blog", "cache:blog:1"), Err(CacheError::UnknownBusiness(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_tombstone_and_readd() -> Result<(), Box<dyn Error>> {
        let lookup = ShopLookup::with_shops(1..=100);
        let filters = filters(&lookup, 0.5);
        assert!(filters.rebuild_one("shop").await?);

        filters.tombstone("shop", "cache:shop:42")?;
        assert!(!filters.might_contain("shop", "cache:shop:42")?);
        assert!(filters.bloom_contains("shop", "cache:shop:42")?);

        filters.add("shop", "cache:shop:42")?;
        assert!(filters.might_contain("shop", "cache:shop:42")?);
        assert_eq!(filters.stats("shop")?.tombstones, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_ratio_triggers_rebuild() -> Result<(), Box<dyn Error>> {
        let lookup = ShopLookup::with_shops(1..=10);
        let filters = filters(&lookup, 0.2);
        assert!(filters.rebuild_one("shop").await?);
        assert_eq!(filters.stats("shop")?.rebuilds, 1);

        for id in 1..=3 {
            lookup.remove(id);
            filters.tombstone("shop", &format!("cache:shop:{id}"))?;
        }

        wait_rebuilds(&filters, 2).await?;

        let stats = filters.stats("shop")?;
        assert_eq!(stats.inserted, 7);
        assert_eq!(stats.deletes, 0);
        assert!(!filters.might_contain("shop", "cache:shop:1")?);
        assert!(filters.might_contain("shop", "cache:shop:4")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_rebuild_replays_concurrent_changes() -> Result<(), Box<dyn Error>> {
        let lookup = ShopLookup::with_shops(1..=10);
        let filters = Arc::new(filters(&lookup, 10.0));
        assert!(filters.rebuild_one("shop").await?);

        let gate = lookup.hold_scans();
        let rebuild = tokio::spawn({
            let filters = filters.clone();
            async move { filters.rebuild_one("shop").await }
        });
        gate.wait_started().await;

        // The scan snapshot still lists shop 3 and doesn't know about shop 500.
        filters.add("shop", "cache:shop:500")?;
        filters.tombstone("shop", "cache:shop:3")?;
        assert!(!filters.rebuild_one("shop").await?, "overlapping rebuild must be refused");

        gate.release();
        assert!(rebuild.await??);

        assert!(filters.might_contain("shop", "cache:shop:500")?);
        assert!(!filters.might_contain("shop", "cache:shop:3")?);
        assert_eq!(filters.stats("shop")?.rebuilds, 2);
        Ok(())
    }

    async fn wait_rebuilds(filters: &ExistenceFilters, count: u64) -> Result<(), Box<dyn Error>> {
        let mut waited = Duration::ZERO;
        while filters.stats("shop")?.rebuilds < count {
            assert!(waited < Duration::from_secs(5), "delete-triggered rebuild never happened");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_repeated_adds_keep_delete_ratio() -> Result<(), Box<dyn Error>> {
        let lookup = ShopLookup::with_shops(1..=10);
        let filters = filters(&lookup, 0.2);
        assert!(filters.rebuild_one("shop").await?);

        // A hot entity written over and over doesn't dilute later deletions.
        for _ in 0..50 {
            filters.add("shop", "cache:shop:1")?;
        }
        assert_eq!(filters.stats("shop")?.inserted, 10);

        for id in 2..=4 {
            lookup.remove(id);
            filters.tombstone("shop", &format!("cache:shop:{id}"))?;
        }
        wait_rebuilds(&filters, 2).await?;
        assert_eq!(filters.stats("shop")?.inserted, 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_repeated_delete_counts_once() -> Result<(), Box<dyn Error>> {
        let lookup = ShopLookup::with_shops(1..=100);
        let filters = filters(&lookup, 0.2);
        assert!(filters.rebuild_one("shop").await?);

        for _ in 0..3 {
            filters.tombstone("shop", "cache:shop:42")?;
        }
        let stats = filters.stats("shop")?;
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.rebuilds, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_sampled_false_positive_rate() -> Result<(), Box<dyn Error>> {
        let lookup = ShopLookup::with_shops(1..=5000);
        let config = BusinessTypeConfig::builder()
            .false_positive_rate(0.05)
            .build()
            .expect("business config");
        let filters = filters_with(&lookup, config);
        assert!(filters.rebuild_one("shop").await?);
        // Default headroom doubles the known population.
        assert_eq!(filters.stats("shop")?.capacity, 10_000);

        let samples = 10_000;
        let false_positives = (5001..5001 + samples)
            .filter(|id| filters.might_contain("shop", &format!("cache:shop:{id}")).unwrap_or(true))
            .count();
        let fp_rate = false_positives as f64 / samples as f64;
        assert!(fp_rate < 0.05, "FP rate too high: {fp_rate:.4}");
        Ok(())
    }
}
