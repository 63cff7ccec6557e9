//! # cache-shield
//!
//! Layered read-through cache for fleets of nodes sharing one system of record.
//!
//! A lookup descends through up to four tiers and populates each one it passed on the way back:
//!
//! 1. the node-local cache, a [moka](https://crates.io/crates/moka) cache with short-lived entries;
//! 2. the existence filter of the business type, a Bloom filter which rejects identifiers that certainly don't
//!    exist before they cost anything;
//! 3. the distributed store shared by all nodes;
//! 4. the fallback to the system of record.
//!
//! # What It Protects Against
//!
//! - **Penetration.** Requests for records that don't exist are stopped by the existence filter. Those slipping
//!   through its false positives leave a short-lived null marker behind, so the system of record sees them once.
//! - **Breakdown.** Concurrent misses of one key on a node are coalesced into a single load. Entries of business
//!   types with logical expiry are never dropped by the store: a stale one is served while exactly one node
//!   rebuilds it in the background under a lease lock.
//! - **Avalanche.** Physical TTLs get a random extension so entries written together don't expire together.
//!
//! # Consistency
//!
//! Writers call [`CacheEngine::invalidate_on_write`] after committing to the system of record. The key is dropped
//! from the distributed store and every node's local cache via the invalidation bus. Writes that bypass the
//! application are caught by the change feed: [`ChangeFeedBridge`] moves database row changes into a durable queue
//! and [`ChangeFeedConsumer`] turns them into invalidations with at-least-once semantics.
//!
//! ```ignore
//! let registry = BusinessRegistry::new()
//!     .register(BusinessType::new("shop", "cache:shop:", shop_config, shops.clone()))?;
//! let engine = CacheEngine::builder()
//!     .registry(Arc::new(registry))
//!     .config(Arc::new(EngineConfig::from_env()?))
//!     .kv(Arc::new(RedisStore::new(pool.clone())))
//!     .channel(Arc::new(RedisBroadcast::new(pool, &url)?))
//!     .build()?;
//! engine.start().await?;
//!
//! let shop: Option<Shop> = engine.resolve_default("shop", 42).await?;
//! ```

pub mod bloom;
pub mod bus;
pub mod business;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod existence;
pub mod feed;
pub(crate) mod listener;
pub mod local;
pub mod lock;
pub mod memory;
#[cfg(feature = "sea-orm")]
pub mod orm;
pub mod rebuild;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod store;
#[cfg(feature = "tracing")]
pub mod telemetry;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use business::BusinessRegistry;
#[doc(inline)]
pub use business::BusinessType;
#[doc(inline)]
pub use config::BusinessTypeConfig;
#[doc(inline)]
pub use config::EngineConfig;
#[doc(inline)]
pub use engine::CacheEngine;
#[doc(inline)]
pub use error::CacheError;
#[doc(inline)]
pub use feed::ChangeFeedBridge;
#[doc(inline)]
pub use feed::ChangeFeedConsumer;

pub mod prelude {
    pub use crate::business::BusinessRegistry;
    pub use crate::business::BusinessType;
    pub use crate::config::BusinessTypeConfig;
    pub use crate::config::EngineConfig;
    pub use crate::engine::CacheEngine;
    pub use crate::error::CacheError;
    pub use crate::traits::*;
    pub use crate::types::*;
}
