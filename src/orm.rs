use std::fmt::Debug;
use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use sea_orm::EntityTrait;
use sea_orm::PaginatorTrait;
use sea_orm::PrimaryKeyTrait;
use sea_orm::QuerySelect;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::error::CacheError;
use crate::error::Result;
use crate::traits::Lookup;

type PrimaryKeyOf<E> = <<E as EntityTrait>::PrimaryKey as PrimaryKeyTrait>::ValueType;

/// [`Lookup`] over a SeaORM entity with a single-column primary key. Models are cached as they serialize.
pub struct EntityLookup<E: EntityTrait> {
    db:        DatabaseConnection,
    id_column: E::Column,
    _entity:   PhantomData<fn() -> E>,
}

impl<E: EntityTrait> EntityLookup<E> {
    /// `id_column` is the primary key column; it's what existence filters are built from.
    pub fn new(db: DatabaseConnection, id_column: E::Column) -> Self {
        Self {
            db,
            id_column,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<E> Lookup for EntityLookup<E>
where
    E: EntityTrait + Send + Sync,
    E::Column: Send + Sync,
    E::Model: Serialize + DeserializeOwned + Debug + Clone + Send + Sync,
    PrimaryKeyOf<E>: FromStr + Display + Sync,
{
    type Error = CacheError;
    type Value = E::Model;

    #[instrument(level = "trace", skip(self))]
    async fn lookup(&self, id: &str) -> Result<Option<E::Model>> {
        // Doesn't parse as a key, can't be a row.
        let Ok(id) = id.parse::<PrimaryKeyOf<E>>()
        else {
            return Ok(None);
        };
        Ok(E::find_by_id(id).one(&self.db).await?)
    }

    async fn live_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<PrimaryKeyOf<E>> = E::find()
            .select_only()
            .column(self.id_column)
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    async fn estimate_count(&self) -> Result<u64> {
        Ok(E::find().count(&self.db).await?)
    }
}
