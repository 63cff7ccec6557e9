//! Invalidations for writes which never went through the engine: bulk loads, admin consoles, other services sharing
//! the database.
//!
//! [`ChangeFeedBridge`] tails the database change stream and turns row changes into [`ChangeFeedMessage`]s on a
//! durable queue. [`ChangeFeedConsumer`] takes them from the queue and invalidates the affected keys on behalf of the
//! writer. Both sides only move their position forward after the work is done, so a restart resumes where it
//! stopped. Some events may then be seen twice which is harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::config::EngineConfig;
use crate::engine::CacheEngine;
use crate::error::Result;
use crate::traits::ChangeQueue;
use crate::traits::ChangeStream;
use crate::types::ChangeFeedMessage;

/// Producer side: database change stream to durable queue.
pub struct ChangeFeedBridge<S, Q> {
    stream: Arc<S>,
    queue:  Arc<Q>,
    tables: Vec<String>,
    batch:  usize,
    idle:   Duration,
}

impl<S, Q> ChangeFeedBridge<S, Q>
where
    S: ChangeStream,
    Q: ChangeQueue,
{
    pub fn new(stream: Arc<S>, queue: Arc<Q>, config: &EngineConfig) -> Self {
        Self {
            stream,
            queue,
            tables: config.feed_tables(),
            batch: config.feed_batch(),
            idle: config.feed_idle(),
        }
    }

    fn tracks(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|t| t == table)
    }

    /// Forward one batch of row changes. Returns how many changes were consumed from the stream.
    ///
    /// A change's position is committed only after its message is in the queue; a failed push leaves it and
    /// everything after it for the next attempt.
    pub async fn pump(&self) -> Result<usize> {
        let changes = self.stream.poll(self.batch).await?;
        let consumed = changes.len();

        for change in changes {
            if self.tracks(&change.table) {
                let message = ChangeFeedMessage::new(change.table, change.operation, change.data);
                self.queue.push(serde_json::to_string(&message)?).await?;
                trace!(table = %message.table, operation = %message.operation, "row change forwarded");
            }
            self.stream.commit(&change.position).await?;
        }

        Ok(consumed)
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.pump().await {
                    Ok(0) => tokio::time::sleep(self.idle).await,
                    Ok(consumed) => trace!(consumed, "change stream batch forwarded"),
                    Err(err) => {
                        warn!(error = %err, "change stream batch failed, retrying");
                        tokio::time::sleep(self.idle).await;
                    }
                }
            }
        })
    }
}

/// Consumer side: applies queued row changes as invalidations through the engine.
pub struct ChangeFeedConsumer<Q> {
    engine: Arc<CacheEngine>,
    queue:  Arc<Q>,
    batch:  usize,
    idle:   Duration,
}

impl<Q: ChangeQueue> ChangeFeedConsumer<Q> {
    pub fn new(engine: Arc<CacheEngine>, queue: Arc<Q>) -> Self {
        let config = engine.config();
        Self {
            batch: config.feed_batch(),
            idle: config.feed_idle(),
            engine,
            queue,
        }
    }

    /// Process one batch of deliveries, acknowledging each one after it was applied. The first failure ends the
    /// batch and leaves the failed delivery unacknowledged. Returns the number of acknowledged deliveries.
    pub async fn process_batch(&self) -> Result<usize> {
        let deliveries = self.queue.fetch(self.batch).await?;
        let mut acked = 0;
        for delivery in deliveries {
            self.apply(&delivery.payload).await?;
            self.queue.ack(&delivery.offset).await?;
            acked += 1;
        }
        Ok(acked)
    }

    async fn apply(&self, payload: &str) -> Result<()> {
        let message = match serde_json::from_str::<ChangeFeedMessage>(payload) {
            Ok(message) => message,
            Err(err) => {
                // Nothing is ever going to make it decodable; holding on to it would only stall the feed.
                error!(error = %err, payload = %payload, "undecodable change-feed message dropped");
                return Ok(());
            }
        };

        if !self.engine.config().feed_allows(&message.table) {
            trace!(table = %message.table, "table not in the allow-list");
            return Ok(());
        }
        let Some(business) = self.engine.registry().business_for_table(&message.table)
        else {
            debug!(table = %message.table, "no business type for table");
            return Ok(());
        };
        let Some(id) = message.row_id()
        else {
            error!(table = %message.table, payload = %payload, "change-feed message without row id dropped");
            return Ok(());
        };

        self.engine
            .invalidate_on_write(business.code(), &id, message.operation.invalidation())
            .await
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.process_batch().await {
                    Ok(0) => tokio::time::sleep(self.idle).await,
                    Ok(acked) => trace!(acked, "change-feed batch applied"),
                    Err(err) => {
                        warn!(error = %err, "change-feed batch interrupted, unacknowledged messages will be redelivered");
                        tokio::time::sleep(self.idle).await;
                    }
                }
            }
        })
    }
}
