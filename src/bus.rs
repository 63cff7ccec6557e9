use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::traits::Broadcast;
use crate::traits::Clock;
use crate::types::InvalidationMessage;
use crate::types::Operation;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Receives every invalidation delivered by the bus. Must tolerate duplicates and any order.
#[async_trait]
pub trait InvalidationHandler: Send + Sync + 'static {
    async fn on_invalidation(&self, message: &InvalidationMessage);
}

/// Invalidation messages over a [`Broadcast`] topic.
pub struct InvalidationBus {
    channel: Arc<dyn Broadcast>,
    topic:   String,
    clock:   Arc<dyn Clock>,
}

impl InvalidationBus {
    pub fn new(channel: Arc<dyn Broadcast>, topic: String, clock: Arc<dyn Clock>) -> Self {
        Self { channel, topic, clock }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, operation: Operation, key: &str) -> Result<()> {
        let message = InvalidationMessage::new(operation, key, self.clock.now_millis());
        self.channel
            .publish(&self.topic, serde_json::to_string(&message)?)
            .await?;
        debug!(key = %key, %operation, "published invalidation");
        Ok(())
    }

    /// Feed every message of the topic to `handler` until the returned task is aborted. The subscription is in
    /// place when this method returns. A lost subscription is re-established with exponential backoff.
    pub async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> Result<JoinHandle<()>> {
        let mut stream = self.channel.subscribe(&self.topic).await?;
        let channel = self.channel.clone();
        let topic = self.topic.clone();
        info!(topic = %topic, "subscribed to invalidations");

        Ok(tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                while let Some(payload) = stream.next().await {
                    backoff = INITIAL_BACKOFF;
                    match serde_json::from_str::<InvalidationMessage>(&payload) {
                        Ok(message) => handler.on_invalidation(&message).await,
                        Err(err) => warn!(error = %err, payload = %payload, "dropping malformed invalidation message"),
                    }
                }

                loop {
                    warn!(
                        topic = %topic,
                        backoff_secs = backoff.as_secs(),
                        "invalidation subscription lost, resubscribing"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    match channel.subscribe(&topic).await {
                        Ok(resumed) => {
                            info!(topic = %topic, "resubscribed to invalidations");
                            stream = resumed;
                            break;
                        }
                        Err(err) => error!(error = %err, "failed to resubscribe to invalidations"),
                    }
                }
            }
        }))
    }
}
