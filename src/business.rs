use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::BusinessTypeConfig;
use crate::error::CacheError;
use crate::error::Result;
use crate::traits::Lookup;

/// Type-erased access to a business type's system of record. Entities travel as JSON from here on.
#[async_trait]
pub trait RecordSource: Send + Sync + 'static {
    async fn fetch(&self, id: &str) -> Result<Option<Value>>;
    async fn live_ids(&self) -> Result<Vec<String>>;
    async fn estimate_count(&self) -> Result<u64>;
}

struct LookupSource<L> {
    business: String,
    lookup:   L,
}

impl<L: Lookup> LookupSource<L> {
    fn failure(&self, err: L::Error) -> CacheError {
        CacheError::Lookup {
            business: self.business.clone(),
            message:  err.to_string(),
        }
    }
}

#[async_trait]
impl<L: Lookup> RecordSource for LookupSource<L> {
    async fn fetch(&self, id: &str) -> Result<Option<Value>> {
        match self.lookup.lookup(id).await.map_err(|err| self.failure(err))? {
            Some(entity) => Ok(Some(serde_json::to_value(entity)?)),
            None => Ok(None),
        }
    }

    async fn live_ids(&self) -> Result<Vec<String>> {
        self.lookup.live_ids().await.map_err(|err| self.failure(err))
    }

    async fn estimate_count(&self) -> Result<u64> {
        self.lookup.estimate_count().await.map_err(|err| self.failure(err))
    }
}

/// A cache namespace: one kind of entity, its key prefix and how its entries live.
#[derive(Clone)]
pub struct BusinessType {
    code:       String,
    key_prefix: String,
    table:      String,
    config:     BusinessTypeConfig,
    source:     Arc<dyn RecordSource>,
}

impl BusinessType {
    pub fn new<L: Lookup>(code: &str, key_prefix: &str, config: BusinessTypeConfig, lookup: L) -> Self {
        Self {
            code: code.to_string(),
            key_prefix: key_prefix.to_string(),
            table: code.to_string(),
            config,
            source: Arc::new(LookupSource {
                business: code.to_string(),
                lookup,
            }),
        }
    }

    /// Database table whose change-feed events concern this type. Defaults to the type code.
    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn config(&self) -> &BusinessTypeConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn RecordSource> {
        &self.source
    }

    #[inline]
    pub fn key_for(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    pub fn id_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.key_prefix.as_str())
    }
}

impl Debug for BusinessType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusinessType")
            .field("code", &self.code)
            .field("key_prefix", &self.key_prefix)
            .field("table", &self.table)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// All business types known to the engine. Assembled once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct BusinessRegistry {
    types: HashMap<String, Arc<BusinessType>>,
}

impl BusinessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, business: BusinessType) -> Result<Self> {
        let code = business.code().to_string();
        if code.is_empty() {
            return Err(CacheError::config("business type code cannot be empty"));
        }
        if business.key_prefix().is_empty() {
            return Err(CacheError::config(format!("'{code}': key prefix cannot be empty")));
        }
        business.config().check(&code)?;

        for known in self.types.values() {
            if known.code() == code {
                return Err(CacheError::config(format!("business type '{code}' is already registered")));
            }
            if known.key_prefix() == business.key_prefix() {
                return Err(CacheError::config(format!(
                    "'{code}' and '{}' share key prefix '{}'",
                    known.code(),
                    known.key_prefix()
                )));
            }
        }

        self.types.insert(code, Arc::new(business));
        Ok(self)
    }

    pub fn get(&self, code: &str) -> Result<Arc<BusinessType>> {
        self.types
            .get(code)
            .cloned()
            .ok_or_else(|| CacheError::UnknownBusiness(code.to_string()))
    }

    /// The type owning a cache key. With nested prefixes the longest one wins.
    pub fn business_for_key(&self, key: &str) -> Option<Arc<BusinessType>> {
        self.types
            .values()
            .filter(|bt| key.starts_with(bt.key_prefix()))
            .max_by_key(|bt| bt.key_prefix().len())
            .cloned()
    }

    pub fn business_for_table(&self, table: &str) -> Option<Arc<BusinessType>> {
        self.types.values().find(|bt| bt.table() == table).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BusinessType>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
