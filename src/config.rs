use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fieldx::fxstruct;
use garde::Validate;

use crate::error::CacheError;
use crate::error::Result;
use crate::types::ExpiryMode;

/// Engine-wide settings. Every option can also come from a `CACHE_SHIELD_*` environment variable.
#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "cache-shield")]
pub struct EngineConfig {
    /// Maximum number of entries in the node-local cache.
    #[clap(long, env = "CACHE_SHIELD_LOCAL_CAPACITY", default_value_t = 10_000)]
    #[garde(range(min = 1))]
    local_capacity: u64,

    /// Lifetime of a node-local entry, in milliseconds. Must be shorter than any distributed TTL.
    #[clap(long, env = "CACHE_SHIELD_LOCAL_TTL_MS", default_value_t = 60_000)]
    #[garde(range(min = 1))]
    local_ttl_ms: u64,

    /// Lease of a rebuild lock, in milliseconds. A crashed rebuild holds its key no longer than this.
    #[clap(long, env = "CACHE_SHIELD_LOCK_LEASE_MS", default_value_t = 10_000)]
    #[garde(range(min = 1))]
    lock_lease_ms: u64,

    /// Number of concurrently running rebuilds. 0 means the number of CPUs.
    #[clap(long, env = "CACHE_SHIELD_REBUILD_WORKERS", default_value_t = 0)]
    #[garde(skip)]
    rebuild_workers: usize,

    /// Period of full existence-filter rebuilds, in seconds. 0 disables periodic rebuilds.
    #[clap(long, env = "CACHE_SHIELD_FILTER_REBUILD_SECS", default_value_t = 86_400)]
    #[garde(skip)]
    filter_rebuild_secs: u64,

    /// Upper bound of the random extension of physical TTLs, as a share of the TTL.
    #[clap(long, env = "CACHE_SHIELD_JITTER_RATIO", default_value_t = 0.2)]
    #[garde(range(min = 0.0, max = 1.0))]
    jitter_ratio: f64,

    /// Broadcast topic of invalidation messages.
    #[clap(long, env = "CACHE_SHIELD_INVALIDATION_TOPIC", default_value = "cache:invalidate")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    invalidation_topic: String,

    /// Tables whose row changes are turned into invalidations. Empty means all registered tables.
    #[clap(long = "feed-table", env = "CACHE_SHIELD_FEED_TABLES", value_delimiter = ',')]
    #[fieldx(get(clone))]
    #[garde(skip)]
    feed_tables: Vec<String>,

    /// How many change-feed messages are processed per batch.
    #[clap(long, env = "CACHE_SHIELD_FEED_BATCH", default_value_t = 100)]
    #[garde(range(min = 1))]
    feed_batch: usize,

    /// Pause between change-feed polls when there is nothing to do, in milliseconds.
    #[clap(long, env = "CACHE_SHIELD_FEED_IDLE_MS", default_value_t = 500)]
    #[garde(skip)]
    feed_idle_ms: u64,

    /// Redis URL. When omitted the in-memory backends are used.
    #[clap(long, env = "CACHE_SHIELD_REDIS_URL")]
    #[fieldx(get(clone))]
    #[garde(skip)]
    redis_url: Option<String>,

    /// File to send log into
    #[clap(long, env = "CACHE_SHIELD_LOG_FILE")]
    #[fieldx(get(clone))]
    #[garde(skip)]
    log_file: Option<PathBuf>,
}

impl EngineConfig {
    /// Parse and validate a command line. Options missing from it are taken from the environment or defaults.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = Self::try_parse_from(args).map_err(|err| CacheError::config(err.to_string().trim_end()))?;
        config
            .validate()
            .map_err(|report| CacheError::config(report.to_string()))?;
        Ok(config)
    }

    /// Configuration from environment variables and defaults only.
    pub fn from_env() -> Result<Self> {
        Self::from_args([env!("CARGO_PKG_NAME")])
    }

    pub fn local_ttl(&self) -> Duration {
        Duration::from_millis(self.local_ttl_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn filter_rebuild_interval(&self) -> Option<Duration> {
        (self.filter_rebuild_secs > 0).then(|| Duration::from_secs(self.filter_rebuild_secs))
    }

    pub fn feed_idle(&self) -> Duration {
        Duration::from_millis(self.feed_idle_ms)
    }

    pub fn worker_count(&self) -> usize {
        if self.rebuild_workers == 0 {
            num_cpus::get().max(1)
        }
        else {
            self.rebuild_workers
        }
    }

    /// Whether change-feed events of `table` are to be applied.
    pub fn feed_allows(&self, table: &str) -> bool {
        self.feed_tables.is_empty() || self.feed_tables.iter().any(|t| t == table)
    }
}

/// Per-business-type tuning. Hot, frequently queried types usually want a tighter false-positive rate; types that
/// churn faster want a lower delete ratio.
#[derive(Debug, Clone)]
#[fxstruct(no_new, builder, get(copy))]
pub struct BusinessTypeConfig {
    /// Target false-positive rate of the existence filter.
    #[fieldx(default(0.01))]
    false_positive_rate: f64,

    /// Share of deletions, relative to the filter population, which triggers a full filter rebuild.
    #[fieldx(default(0.2))]
    delete_rebuild_ratio: f64,

    #[fieldx(default(ExpiryMode::physical(Duration::from_secs(30 * 60))))]
    expiry: ExpiryMode,

    /// Lifetime of a null marker.
    #[fieldx(default(Duration::from_secs(120)))]
    null_ttl: Duration,

    /// Expected number of records. 0 means "ask the system of record".
    #[fieldx(default(0))]
    expected_insertions: u64,

    /// Filter capacity multiplier over the known record count, leaving room for growth between rebuilds.
    #[fieldx(default(2.0))]
    capacity_headroom: f64,
}

impl BusinessTypeConfig {
    pub fn check(&self, code: &str) -> Result<()> {
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(CacheError::config(format!(
                "'{code}': false positive rate must be within (0, 1), got {}",
                self.false_positive_rate
            )));
        }
        if self.delete_rebuild_ratio <= 0.0 {
            return Err(CacheError::config(format!(
                "'{code}': delete rebuild ratio must be positive, got {}",
                self.delete_rebuild_ratio
            )));
        }
        if self.capacity_headroom < 1.0 {
            return Err(CacheError::config(format!(
                "'{code}': capacity headroom cannot be less than 1, got {}",
                self.capacity_headroom
            )));
        }
        if self.null_ttl.is_zero() {
            return Err(CacheError::config(format!("'{code}': null marker TTL cannot be zero")));
        }
        match self.expiry {
            ExpiryMode::Physical { ttl } if ttl.is_zero() => {
                Err(CacheError::config(format!("'{code}': physical TTL cannot be zero")))
            }
            ExpiryMode::Logical { horizon, .. } if horizon.is_zero() => {
                Err(CacheError::config(format!("'{code}': logical horizon cannot be zero")))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_parsing() {
        let config = EngineConfig::from_args([
            "cmd",
            "--local-capacity",
            "500",
            "--lock-lease-ms=2500",
            "--feed-table=shop,blog",
            "--filter-rebuild-secs=0",
        ])
        .expect("Failed to parse engine config");
        assert_eq!(config.local_capacity(), 500);
        assert_eq!(config.lock_lease(), Duration::from_millis(2500));
        assert_eq!(config.feed_tables(), vec!["shop".to_string(), "blog".to_string()]);
        assert!(config.feed_allows("blog"));
        assert!(!config.feed_allows("voucher"));
        assert_eq!(config.filter_rebuild_interval(), None);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_engine_config_rejects_bad_jitter() {
        let err = EngineConfig::from_args(["cmd", "--jitter-ratio=1.5"]).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)), "unexpected error: {err}");
    }

    #[test]
    fn test_business_config_defaults_and_checks() {
        let config = BusinessTypeConfig::builder().build().expect("default business config");
        assert_eq!(config.false_positive_rate(), 0.01);
        assert_eq!(config.null_ttl(), Duration::from_secs(120));
        assert!(config.check("shop").is_ok());

        let config = BusinessTypeConfig::builder()
            .false_positive_rate(1.0)
            .build()
            .expect("business config");
        assert!(config.check("shop").is_err());

        let config = BusinessTypeConfig::builder()
            .expiry(ExpiryMode::logical(Duration::ZERO))
            .build()
            .expect("business config");
        assert!(config.check("shop").is_err());
    }
}
