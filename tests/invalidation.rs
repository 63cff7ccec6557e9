use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use cache_shield::memory::MemoryChangeStream;
use cache_shield::memory::MemoryQueue;
use cache_shield::prelude::*;
use cache_shield::test::Shop;
use cache_shield::test::ShopLookup;
use cache_shield::test::TestCluster;
use cache_shield::ChangeFeedBridge;
use cache_shield::ChangeFeedConsumer;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn message(table: &str, operation: ChangeOperation, id: u64) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ChangeFeedMessage::new(table, operation, row(json!({ "id": id }))))
}

async fn wait_gone(node: &CacheEngine, id: u64) -> Result<(), Box<dyn Error>> {
    for _ in 0..500 {
        if !node.might_exist("shop", id).await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(format!("shop {id} is still visible on node {}", node.name()).into())
}

#[tokio::test]
async fn delete_reaches_every_node() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::new(
        ShopLookup::with_shops(1..=100),
        ExpiryMode::physical(Duration::from_secs(600)),
    );
    let a = cluster.node("a").await?;
    let b = cluster.node("b").await?;

    let shop: Option<Shop> = a.resolve_default("shop", 42).await?;
    assert_eq!(shop, Some(Shop::new(42)));
    let shop: Option<Shop> = b.resolve_default("shop", 42).await?;
    assert_eq!(shop, Some(Shop::new(42)));
    assert_eq!(cluster.shops.lookups(), 1);

    // Deleted by somebody who doesn't know about the cache.
    cluster.shops.remove(42);
    let queue = Arc::new(MemoryQueue::new());
    queue.push(message("shop", ChangeOperation::Delete, 42)?).await?;

    let consumer = ChangeFeedConsumer::new(a.clone(), queue.clone());
    assert_eq!(consumer.process_batch().await?, 1);
    assert_eq!(queue.unacked(), 0);

    wait_gone(&a, 42).await?;
    wait_gone(&b, 42).await?;
    assert!(cluster.kv.get("cache:shop:42").await?.is_none());

    for node in [&a, &b] {
        let stats = node.filter_stats("shop")?;
        assert_eq!(stats.tombstones, 1, "node {}", node.name());
        assert_eq!(stats.deletes, 1, "node {}", node.name());
        let shop: Option<Shop> = node.resolve_default("shop", 42).await?;
        assert_eq!(shop, None);
    }
    assert_eq!(cluster.shops.lookups(), 1, "tombstoned keys never reach the database");

    a.close().await;
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn write_through_one_node_evicts_the_other() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::new(
        ShopLookup::with_shops(1..=10),
        ExpiryMode::physical(Duration::from_secs(600)),
    );
    let a = cluster.node("a").await?;
    let b = cluster.node("b").await?;

    let _: Option<Shop> = b.resolve_default("shop", 2).await?;
    cluster.shops.insert(Shop {
        id:   2,
        name: "Two".into(),
    });
    a.invalidate_on_write("shop", 2, Operation::Update).await?;

    let mut name = None;
    for _ in 0..500 {
        let shop: Option<Shop> = b.resolve_default("shop", 2).await?;
        name = shop.map(|s| s.name);
        if name.as_deref() == Some("Two") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(name.as_deref(), Some("Two"));

    a.close().await;
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn interrupted_batch_is_redelivered() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::new(
        ShopLookup::with_shops(1..=100),
        ExpiryMode::physical(Duration::from_secs(600)),
    );
    let node = cluster.node("a").await?;
    cluster.shops.remove(1);
    let queue = Arc::new(MemoryQueue::new());
    queue.push(message("shop", ChangeOperation::Delete, 1)?).await?;
    queue.push(message("shop", ChangeOperation::Update, 2)?).await?;

    let consumer = ChangeFeedConsumer::new(node.clone(), queue.clone());

    cluster.kv.set_offline(true);
    assert!(consumer.process_batch().await.is_err());
    assert_eq!(queue.unacked(), 2);

    cluster.kv.set_offline(false);
    assert_eq!(consumer.process_batch().await?, 2);
    assert_eq!(queue.unacked(), 0);
    assert_eq!(consumer.process_batch().await?, 0);
    assert!(!node.might_exist("shop", 1).await?);
    assert!(node.might_exist("shop", 2).await?);

    node.close().await;
    Ok(())
}

#[tokio::test]
async fn unusable_messages_are_dropped() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::new(
        ShopLookup::with_shops(1..=100),
        ExpiryMode::physical(Duration::from_secs(600)),
    );
    let node = cluster.node("a").await?;
    let queue = Arc::new(MemoryQueue::new());
    queue.push("{definitely not json".into()).await?;
    queue
        .push(r#"{"table":"shop","operation":"DELETE","data":{"name":"no id"}}"#.into())
        .await?;
    queue.push(message("orders", ChangeOperation::Delete, 3)?).await?;
    queue.push(message("shop", ChangeOperation::Delete, 3)?).await?;

    let consumer = ChangeFeedConsumer::new(node.clone(), queue.clone());
    assert_eq!(consumer.process_batch().await?, 4);
    assert_eq!(queue.unacked(), 0);
    assert_eq!(node.filter_stats("shop")?.tombstones, 1);

    node.close().await;
    Ok(())
}

#[tokio::test]
async fn allow_list_limits_applied_tables() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::new(
        ShopLookup::with_shops(1..=10),
        ExpiryMode::physical(Duration::from_secs(600)),
    );
    let node = cluster
        .node_with("a", TestCluster::config(&["--feed-table", "orders"]))
        .await?;
    let queue = Arc::new(MemoryQueue::new());
    queue.push(message("shop", ChangeOperation::Delete, 3)?).await?;

    let consumer = ChangeFeedConsumer::new(node.clone(), queue.clone());
    assert_eq!(consumer.process_batch().await?, 1);
    assert!(node.might_exist("shop", 3).await?);

    node.close().await;
    Ok(())
}

#[tokio::test]
async fn bridge_commits_after_push() -> Result<(), Box<dyn Error>> {
    let stream = Arc::new(MemoryChangeStream::new());
    let queue = Arc::new(MemoryQueue::new());
    let config = TestCluster::config(&["--feed-table", "shop"]);
    let bridge = ChangeFeedBridge::new(stream.clone(), queue.clone(), &config);

    stream.push_change("shop", ChangeOperation::Delete, row(json!({"id": 3})));
    stream.push_change("audit_log", ChangeOperation::Insert, row(json!({"id": 1, "what": "login"})));
    assert_eq!(bridge.pump().await?, 2);
    assert_eq!(stream.committed(), 2);
    assert_eq!(queue.unacked(), 1);

    stream.push_change("shop", ChangeOperation::Update, row(json!({"id": 4})));
    queue.set_offline(true);
    assert!(bridge.pump().await.is_err());
    assert_eq!(stream.committed(), 2);

    queue.set_offline(false);
    assert_eq!(bridge.pump().await?, 1);
    assert_eq!(stream.committed(), 3);
    assert_eq!(bridge.pump().await?, 0);

    let deliveries = queue.fetch(10).await?;
    let forwarded = deliveries
        .iter()
        .map(|d| serde_json::from_str::<ChangeFeedMessage>(&d.payload))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(
        forwarded,
        vec![
            ChangeFeedMessage::new("shop", ChangeOperation::Delete, row(json!({"id": 3}))),
            ChangeFeedMessage::new("shop", ChangeOperation::Update, row(json!({"id": 4}))),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn background_consumer_applies_feed() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::new(
        ShopLookup::with_shops(1..=10),
        ExpiryMode::physical(Duration::from_secs(600)),
    );
    let node = cluster.node("a").await?;
    let queue = Arc::new(MemoryQueue::new());
    node.consume_change_feed(queue.clone())?;

    cluster.shops.remove(6);
    queue.push(message("shop", ChangeOperation::Delete, 6)?).await?;
    wait_gone(&node, 6).await?;

    node.close().await;
    Ok(())
}
