//! A single cache node in front of a pretend shop table.
//!
//! ```text
//! RUST_LOG=cache_shield=debug cargo run --example node --features tracing
//! CACHE_SHIELD_REDIS_URL=redis://127.0.0.1/ cargo run --example node --features tracing,redis
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cache_shield::memory::LocalBroadcast;
use cache_shield::memory::MemoryStore;
use cache_shield::prelude::*;
use cache_shield::telemetry::init_tracing;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Shop {
    id:   u64,
    name: String,
}

struct ShopTable {
    rows: HashMap<u64, Shop>,
}

#[async_trait]
impl Lookup for ShopTable {
    type Error = String;
    type Value = Shop;

    async fn lookup(&self, id: &str) -> Result<Option<Shop>, String> {
        let id = id.parse::<u64>().map_err(|err| err.to_string())?;
        // Pretend it is a round trip to a database.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.rows.get(&id).cloned())
    }

    async fn live_ids(&self) -> Result<Vec<String>, String> {
        Ok(self.rows.keys().map(|id| id.to_string()).collect())
    }
}

fn backends(config: &EngineConfig) -> Result<(Arc<dyn KvStore>, Arc<dyn Broadcast>), CacheError> {
    #[cfg(feature = "redis")]
    if let Some(url) = config.redis_url() {
        use cache_shield::redis_backend::create_pool;
        use cache_shield::redis_backend::RedisBroadcast;
        use cache_shield::redis_backend::RedisStore;

        let pool = create_pool(&url)?;
        info!(url = %url, "using Redis backends");
        return Ok((
            Arc::new(RedisStore::new(pool.clone())),
            Arc::new(RedisBroadcast::new(pool, &url)?),
        ));
    }

    if config.redis_url().is_some() {
        tracing::warn!("built without the 'redis' feature, the Redis URL is ignored");
    }
    Ok((
        Arc::new(MemoryStore::new(Arc::new(cache_shield::clock::SystemClock))),
        Arc::new(LocalBroadcast::default()),
    ))
}

#[tokio::main]
async fn main() -> Result<(), CacheError> {
    let config = EngineConfig::from_args(std::env::args_os())?;
    init_tracing(config.log_file().as_deref())?;

    let rows = (1..=1000)
        .map(|id| {
            (id, Shop {
                id,
                name: format!("Shop #{id}"),
            })
        })
        .collect();
    let shop_config = BusinessTypeConfig::builder()
        .expiry(ExpiryMode::logical(Duration::from_secs(30 * 60)))
        .build()
        .map_err(|err| CacheError::config(err.to_string()))?;
    let registry =
        BusinessRegistry::new().register(BusinessType::new("shop", "cache:shop:", shop_config, ShopTable { rows }))?;

    let (kv, channel) = backends(&config)?;
    let engine = CacheEngine::builder()
        .registry(Arc::new(registry))
        .config(Arc::new(config))
        .kv(kv)
        .channel(channel)
        .name("demo")
        .build()
        .map_err(|err| CacheError::Build(err.to_string()))?;
    engine.start().await?;

    for id in [42, 42, 7, 1_000_000, 1_000_000] {
        let shop: Option<Shop> = engine.resolve_default("shop", id).await?;
        info!(id, found = shop.is_some(), "resolved");
    }

    engine.invalidate_on_write("shop", 42, Operation::Update).await?;
    let shop: Option<Shop> = engine.resolve_default("shop", 42).await?;
    info!(shop = ?shop, "resolved after invalidation");

    let stats = engine.filter_stats("shop")?;
    info!(inserted = stats.inserted, capacity = stats.capacity, "existence filter");

    engine.close().await;
    Ok(())
}
