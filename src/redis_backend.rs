//! Redis-backed implementations of the backend seams.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Config;
use deadpool_redis::Connection;
use deadpool_redis::Pool;
use deadpool_redis::Runtime;
use futures_util::future;
use futures_util::StreamExt;
use redis::streams::StreamReadOptions;
use redis::streams::StreamReadReply;
use redis::AsyncCommands;
use redis::Script;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::clock::millis;
use crate::error::CacheError;
use crate::error::Result;
use crate::traits::Broadcast;
use crate::traits::ChangeQueue;
use crate::traits::Delivery;
use crate::traits::KvStore;
use crate::traits::MessageStream;

// Deletes KEYS[1] only if it holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub fn create_pool(url: &str) -> Result<Pool> {
    Config::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|err| CacheError::store(format!("failed to create Redis pool: {err}")))
}

async fn connection(pool: &Pool) -> Result<Connection> {
    pool.get()
        .await
        .map_err(|err| CacheError::store(format!("failed to get Redis connection: {err}")))
}

pub struct RedisStore {
    pool:               Pool,
    compare_and_delete: Script,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(create_pool(url)?))
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = connection(&self.pool).await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        match ttl {
            Some(ttl) => {
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis(ttl).max(1))
                    .query_async(&mut conn)
                    .await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

/// Redis pub/sub. Publishing goes through the pool; every subscription gets its own connection since a subscribed
/// connection can't serve other commands.
pub struct RedisBroadcast {
    pool:   Pool,
    client: redis::Client,
}

impl RedisBroadcast {
    pub fn new(pool: Pool, url: &str) -> Result<Self> {
        Ok(Self {
            pool,
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl Broadcast for RedisBroadcast {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let _: () = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        info!(channel = %topic, "subscribed to Redis channel");

        // The stream ends with the connection.
        Ok(Box::pin(pubsub.into_on_message().filter_map(|msg| {
            future::ready(match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(error = %err, "non-text pub/sub payload dropped");
                    None
                }
            })
        })))
    }
}

/// Durable queue on a Redis stream read through a consumer group. Entries delivered to this consumer but not
/// acknowledged are handed out again before any new ones.
pub struct RedisStreamQueue {
    pool:     Pool,
    stream:   String,
    group:    String,
    consumer: String,
}

impl RedisStreamQueue {
    pub fn new(pool: Pool, stream: &str, group: &str, consumer: &str) -> Self {
        Self {
            pool,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }
    }

    /// Create the stream and the consumer group unless they exist.
    pub async fn ensure_group(&self) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(&self.stream, &self.group, "0").await;
        match created {
            Ok(()) => {
                debug!(stream = %self.stream, group = %self.group, "consumer group created");
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read(&self, conn: &mut Connection, from: &str, max: usize) -> Result<Vec<Delivery<String>>> {
        let options = StreamReadOptions::default().group(&self.group, &self.consumer).count(max);
        let reply: Option<StreamReadReply> = conn.xread_options(&[&self.stream], &[from], &options).await?;
        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|entry| Delivery {
                // An entry without a text payload is handed over empty and dropped by the consumer as undecodable.
                payload: entry.get::<String>("payload").unwrap_or_default(),
                offset:  entry.id,
            })
            .collect())
    }
}

#[async_trait]
impl ChangeQueue for RedisStreamQueue {
    type Offset = String;

    async fn push(&self, payload: String) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let _: String = conn.xadd(&self.stream, "*", &[("payload", payload.as_str())]).await?;
        Ok(())
    }

    async fn fetch(&self, max: usize) -> Result<Vec<Delivery<String>>> {
        let mut conn = connection(&self.pool).await?;
        let pending = self.read(&mut conn, "0", max).await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        self.read(&mut conn, ">", max).await
    }

    async fn ack(&self, offset: &String) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let _: i64 = conn.xack(&self.stream, &self.group, &[offset]).await?;
        Ok(())
    }
}
