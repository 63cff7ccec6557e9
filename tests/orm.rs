#![cfg(feature = "sqlite")]

use std::error::Error;
use std::sync::Arc;

use cache_shield::clock::ManualClock;
use cache_shield::memory::LocalBroadcast;
use cache_shield::memory::MemoryStore;
use cache_shield::orm::EntityLookup;
use cache_shield::prelude::*;
use sea_orm::ConnectOptions;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseConnection;

mod shop {
    use sea_orm::entity::prelude::*;
    use serde::Deserialize;
    use serde::Serialize;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "shops")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id:   i32,
        pub name: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

async fn database() -> Result<DatabaseConnection, Box<dyn Error>> {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    // Every connection to an in-memory database gets a database of its own.
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = sea_orm::Database::connect(opts).await?;

    db.execute_unprepared("CREATE TABLE shops (id INTEGER PRIMARY KEY NOT NULL, name TEXT NOT NULL)")
        .await?;
    for (id, name) in [(1, "Alpha"), (2, "Beta"), (3, "Gamma")] {
        db.execute_unprepared(&format!("INSERT INTO shops (id, name) VALUES ({id}, '{name}')"))
            .await?;
    }
    Ok(db)
}

fn model(id: i32, name: &str) -> shop::Model {
    shop::Model {
        id,
        name: name.to_string(),
    }
}

#[tokio::test]
async fn entity_lookup() -> Result<(), Box<dyn Error>> {
    let lookup = EntityLookup::<shop::Entity>::new(database().await?, shop::Column::Id);

    assert_eq!(lookup.lookup("2").await?, Some(model(2, "Beta")));
    assert_eq!(lookup.lookup("9").await?, None);
    assert_eq!(lookup.lookup("not-an-id").await?, None);

    let mut ids = lookup.live_ids().await?;
    ids.sort();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(lookup.estimate_count().await?, 3);
    Ok(())
}

#[tokio::test]
async fn engine_over_database() -> Result<(), Box<dyn Error>> {
    let db = database().await?;
    let config = BusinessTypeConfig::builder().build()?;
    let registry = BusinessRegistry::new().register(
        BusinessType::new(
            "shop",
            "cache:shop:",
            config,
            EntityLookup::<shop::Entity>::new(db.clone(), shop::Column::Id),
        )
        .with_table("shops"),
    )?;

    let clock = Arc::new(ManualClock::starting_now());
    let kv = Arc::new(MemoryStore::new(clock.clone()));
    let engine = CacheEngine::builder()
        .registry(Arc::new(registry))
        .config(Arc::new(EngineConfig::from_args(["cache-shield", "--filter-rebuild-secs", "0"])?))
        .kv(kv.clone())
        .channel(Arc::new(LocalBroadcast::default()))
        .clock(clock)
        .build()?;
    engine.start().await?;
    assert_eq!(engine.filter_stats("shop")?.inserted, 3);

    let shop: Option<shop::Model> = engine.resolve_default("shop", 3).await?;
    assert_eq!(shop, Some(model(3, "Gamma")));
    assert!(kv.get("cache:shop:3").await?.is_some());
    assert!(!engine.might_exist("shop", 4).await?);

    db.execute_unprepared("UPDATE shops SET name = 'Gamma Prime' WHERE id = 3")
        .await?;
    engine.invalidate_on_write("shop", 3, Operation::Update).await?;
    let shop: Option<shop::Model> = engine.resolve_default("shop", 3).await?;
    assert_eq!(shop, Some(model(3, "Gamma Prime")));

    engine.close().await;
    Ok(())
}
