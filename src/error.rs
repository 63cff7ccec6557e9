use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unknown business type '{0}'")]
    UnknownBusiness(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("distributed store: {0}")]
    Store(String),

    #[error("broadcast channel: {0}")]
    Broadcast(String),

    #[error("change feed: {0}")]
    Feed(String),

    #[error("lookup of '{business}' records failed: {message}")]
    Lookup { business: String, message: String },

    /// The system of record could not answer for the key. Nothing has been cached for it, so the next call
    /// retries from scratch.
    #[error("'{key}' is temporarily unavailable: {reason}")]
    Unavailable { key: String, reason: String },

    #[error("malformed payload: {0}")]
    Serde(#[from] serde_json::Error),

    /// An error produced by a coalesced load and shared between all of its waiters.
    #[error(transparent)]
    Shared(#[from] Arc<CacheError>),

    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "sea-orm")]
    #[error("database: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("failed to build {0}")]
    Build(String),

    #[error("cache engine is gone")]
    EngineGone,
}

impl CacheError {
    pub fn store<S: ToString>(msg: S) -> Self {
        Self::Store(msg.to_string())
    }

    pub fn broadcast<S: ToString>(msg: S) -> Self {
        Self::Broadcast(msg.to_string())
    }

    pub fn feed<S: ToString>(msg: S) -> Self {
        Self::Feed(msg.to_string())
    }

    pub fn config<S: ToString>(msg: S) -> Self {
        Self::Config(msg.to_string())
    }

    /// Turn an error shared between coalesced waiters back into an owned one. Variants that carry a foreign error
    /// stay wrapped in [`Shared`](Self::Shared).
    pub fn unshare(err: Arc<CacheError>) -> Self {
        match &*err {
            Self::UnknownBusiness(code) => Self::UnknownBusiness(code.clone()),
            Self::Config(msg) => Self::Config(msg.clone()),
            Self::Store(msg) => Self::Store(msg.clone()),
            Self::Broadcast(msg) => Self::Broadcast(msg.clone()),
            Self::Feed(msg) => Self::Feed(msg.clone()),
            Self::Lookup { business, message } => Self::Lookup {
                business: business.clone(),
                message:  message.clone(),
            },
            Self::Unavailable { key, reason } => Self::Unavailable {
                key:    key.clone(),
                reason: reason.clone(),
            },
            Self::Build(what) => Self::Build(what.clone()),
            Self::EngineGone => Self::EngineGone,
            Self::Shared(inner) => Self::unshare(inner.clone()),
            _ => Self::Shared(err),
        }
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
