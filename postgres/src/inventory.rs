//! The inventory projection in `inventory_items`.

use crate::error::store_error;
use crate::ledger::decode_rows;
use crate::listen::{INVENTORY_CHANNEL, live_query};
use equipment_ledger_core::document::{self, Record};
use equipment_ledger_core::environment::Clock;
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::item::{Item, ItemId, ItemPatch, NewItem, ProjectionBatch};
use equipment_ledger_core::store::{InventoryStore, LiveQuery, StoreFuture};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;

const UPDATE_ITEM: &str = r"
    UPDATE inventory_items
    SET doc = doc || $2, updated_at = now()
    WHERE id = $1
    RETURNING doc
";

/// [`InventoryStore`] backed by Postgres.
///
/// Patches are merged with `jsonb ||`, so explicit nulls clear a field and
/// absent keys are left alone.
#[derive(Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresInventoryStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

async fn patch_item(
    conn: &mut PgConnection,
    id: &ItemId,
    patch: &ItemPatch,
) -> Result<Item, StoreError> {
    let doc: Option<Value> = sqlx::query_scalar(UPDATE_ITEM)
        .bind(id.as_str())
        .bind(Value::Object(patch.to_fields()))
        .fetch_optional(conn)
        .await
        .map_err(store_error)?;
    let doc = doc.ok_or_else(|| StoreError::NotFound {
        collection: Item::COLLECTION,
        id: id.to_string(),
    })?;
    Ok(document::decode(id.as_str(), doc)?)
}

impl InventoryStore for PostgresInventoryStore {
    fn create(&self, item: NewItem) -> StoreFuture<'_, Item> {
        Box::pin(async move {
            let id = ItemId::new(format!("item-{}", uuid::Uuid::new_v4().simple()));
            let item = item.into_item(id, self.clock.now());
            let doc = document::encode(item.id.as_str(), &item)?;

            sqlx::query(
                "INSERT INTO inventory_items (id, doc, created_at, updated_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(item.id.as_str())
            .bind(Value::Object(doc))
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

            tracing::info!(item = %item.id, name = %item.display_name, "Registered item");
            Ok(item)
        })
    }

    fn get(&self, id: ItemId) -> StoreFuture<'_, Item> {
        Box::pin(async move {
            let doc: Option<Value> =
                sqlx::query_scalar("SELECT doc FROM inventory_items WHERE id = $1")
                    .bind(id.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(store_error)?;
            let doc = doc.ok_or_else(|| StoreError::NotFound {
                collection: Item::COLLECTION,
                id: id.to_string(),
            })?;
            Ok(document::decode(id.as_str(), doc)?)
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<Item>> {
        Box::pin(async move {
            let rows: Vec<(String, Value)> =
                sqlx::query_as("SELECT id, doc FROM inventory_items ORDER BY created_at, id")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(store_error)?;
            Ok(decode_rows::<Item>(rows))
        })
    }

    fn update(&self, id: ItemId, patch: ItemPatch) -> StoreFuture<'_, Item> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(store_error)?;
            patch_item(&mut conn, &id, &patch).await
        })
    }

    fn commit_batch(&self, batch: ProjectionBatch) -> StoreFuture<'_, Vec<Item>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(store_error)?;
            let mut items = Vec::with_capacity(batch.len());
            // Dropping `tx` on an early return rolls the batch back.
            for (id, patch) in batch.iter() {
                items.push(patch_item(&mut tx, id, patch).await?);
            }
            tx.commit().await.map_err(store_error)?;
            tracing::debug!(updated = items.len(), "Committed projection batch");
            Ok(items)
        })
    }

    fn subscribe(&self) -> StoreFuture<'_, LiveQuery<Item>> {
        Box::pin(async move {
            let store = self.clone();
            live_query(&self.pool, INVENTORY_CHANNEL, move || {
                let store = store.clone();
                async move { store.list().await }
            })
            .await
        })
    }
}
