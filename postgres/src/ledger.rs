//! The append-only ledger in `loan_events`.

use crate::error::store_error;
use crate::listen::{LEDGER_CHANNEL, live_query};
use equipment_ledger_core::document::{self, Record};
use equipment_ledger_core::environment::Clock;
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::loan::{LoanClosure, LoanEvent, LoanId, LoanPage, LoanQuery, LoanStatus, NewLoan};
use equipment_ledger_core::store::{LedgerStore, LiveQuery, StoreFuture};
use equipment_ledger_core::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::Arc;

/// [`LedgerStore`] backed by Postgres.
///
/// Each row keeps the full record in `doc` and copies the filter columns out
/// of it, so queries push filters, ordering and paging down to the database.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresLedgerStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    async fn insert(&self, event: &LoanEvent) -> Result<(), StoreError> {
        let doc = document::encode(event.id.as_str(), event)?;
        sqlx::query(
            r"
            INSERT INTO loan_events (id, item_ref, status, borrower_key, classroom, loaned_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(event.id.as_str())
        .bind(&event.item_ref)
        .bind(event.status.as_str())
        .bind(&event.borrower_key)
        .bind(event.classroom.as_deref())
        .bind(event.loaned_at)
        .bind(Value::Object(doc))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    /// Lock the row, let `change` rewrite it, and persist the result in one
    /// transaction.
    async fn rewrite<F>(&self, id: &LoanId, change: F) -> Result<LoanEvent, StoreError>
    where
        F: FnOnce(&mut LoanEvent) -> Result<(), StoreError>,
    {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let doc: Option<Value> =
            sqlx::query_scalar("SELECT doc FROM loan_events WHERE id = $1 FOR UPDATE")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_error)?;
        let Some(doc) = doc else {
            return Err(StoreError::NotFound {
                collection: LoanEvent::COLLECTION,
                id: id.to_string(),
            });
        };

        let mut event: LoanEvent = document::decode(id.as_str(), doc)?;
        change(&mut event)?;

        let doc = document::encode(id.as_str(), &event)?;
        sqlx::query("UPDATE loan_events SET doc = $2, status = $3, item_ref = $4 WHERE id = $1")
            .bind(id.as_str())
            .bind(Value::Object(doc))
            .bind(event.status.as_str())
            .bind(&event.item_ref)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;
        Ok(event)
    }
}

/// Build the pushed-down form of `query`.
///
/// Fetches one row past the limit; [`LoanQuery::apply`] then derives the
/// page and its cursor. Ids compare bytewise, as `LoanId` does.
pub(crate) fn select_loans(query: &LoanQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT id, doc FROM loan_events WHERE TRUE");

    if !query.item_refs.is_empty() {
        qb.push(" AND item_ref = ANY(")
            .push_bind(query.item_refs.clone())
            .push(")");
    }
    if !query.statuses.is_empty() {
        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        qb.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(key) = &query.borrower_key {
        qb.push(" AND borrower_key = ").push_bind(key.clone());
    }
    if let Some(label) = &query.classroom {
        qb.push(" AND classroom = ").push_bind(label.clone());
    }
    if let Some(cursor) = &query.after {
        qb.push(" AND (loaned_at < ")
            .push_bind(cursor.loaned_at)
            .push(" OR (loaned_at = ")
            .push_bind(cursor.loaned_at)
            .push(r#" AND id COLLATE "C" < "#)
            .push_bind(cursor.id.to_string())
            .push("))");
    }

    qb.push(r#" ORDER BY loaned_at DESC, id COLLATE "C" DESC"#);
    if let Some(limit) = query.limit {
        qb.push(" LIMIT ")
            .push_bind(i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX));
    }
    qb
}

/// Decode fetched rows, skipping documents that fail validation.
pub(crate) fn decode_rows<R: Record>(rows: Vec<(String, Value)>) -> Vec<R> {
    rows.into_iter()
        .filter_map(|(id, doc)| match document::decode::<R>(&id, doc) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, collection = R::COLLECTION, "Skipping malformed document");
                metrics::counter!("ledger.store.malformed", "collection" => R::COLLECTION)
                    .increment(1);
                None
            },
        })
        .collect()
}

impl LedgerStore for PostgresLedgerStore {
    fn append(&self, loan: NewLoan) -> StoreFuture<'_, LoanEvent> {
        Box::pin(async move {
            let id = LoanId::new(format!("loan-{}", uuid::Uuid::new_v4().simple()));
            let event = loan.into_event(id, self.clock.now());
            self.insert(&event).await?;
            tracing::debug!(loan = %event.id, item = %event.item_ref, "Appended loan");
            Ok(event)
        })
    }

    fn get(&self, id: LoanId) -> StoreFuture<'_, LoanEvent> {
        Box::pin(async move {
            let doc: Option<Value> = sqlx::query_scalar("SELECT doc FROM loan_events WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;
            let doc = doc.ok_or_else(|| StoreError::NotFound {
                collection: LoanEvent::COLLECTION,
                id: id.to_string(),
            })?;
            Ok(document::decode(id.as_str(), doc)?)
        })
    }

    fn query(&self, query: LoanQuery) -> StoreFuture<'_, LoanPage> {
        Box::pin(async move {
            let mut qb = select_loans(&query);
            let rows: Vec<(String, Value)> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(store_error)?;
            Ok(query.apply(decode_rows::<LoanEvent>(rows)))
        })
    }

    fn close(&self, id: LoanId, closure: LoanClosure) -> StoreFuture<'_, LoanEvent> {
        Box::pin(async move {
            self.rewrite(&id, |event| {
                if !event.is_open() {
                    return Err(StoreError::Conflict(format!(
                        "loan {} is already {}",
                        event.id, event.status
                    )));
                }
                closure.apply_to(event);
                Ok(())
            })
            .await
        })
    }

    fn mark_overdue(&self, id: LoanId, at: DateTime<Utc>) -> StoreFuture<'_, LoanEvent> {
        Box::pin(async move {
            self.rewrite(&id, |event| {
                if event.status != LoanStatus::Active {
                    return Err(StoreError::Conflict(format!(
                        "loan {} is {}",
                        event.id, event.status
                    )));
                }
                event.status = LoanStatus::Overdue;
                event.updated_at = at;
                Ok(())
            })
            .await
        })
    }

    fn backfill_display_name(&self, id: LoanId, display_name: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE loan_events
                SET doc = jsonb_set(doc, '{itemDisplayName}', to_jsonb($2::text))
                WHERE id = $1
                  AND (doc->'itemDisplayName' IS NULL OR doc->'itemDisplayName' = 'null'::jsonb)
                ",
            )
            .bind(id.as_str())
            .bind(display_name)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

            if updated.rows_affected() == 0 {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM loan_events WHERE id = $1)")
                        .bind(id.as_str())
                        .fetch_one(&self.pool)
                        .await
                        .map_err(store_error)?;
                if !exists {
                    return Err(StoreError::NotFound {
                        collection: LoanEvent::COLLECTION,
                        id: id.to_string(),
                    });
                }
            }
            Ok(())
        })
    }

    fn subscribe(&self, query: LoanQuery) -> StoreFuture<'_, LiveQuery<LoanEvent>> {
        Box::pin(async move {
            let store = self.clone();
            live_query(&self.pool, LEDGER_CHANNEL, move || {
                let store = store.clone();
                let query = query.clone();
                async move { store.query(query).await.map(|page| page.loans) }
            })
            .await
        })
    }
}
