//! Store traits for the two record families.
//!
//! The backing store offers per-document atomic writes, batched writes over
//! one collection, filtered/ordered/paged queries and live subscriptions that
//! re-deliver the full result set on every change. There is no transaction
//! spanning [`LedgerStore`] and [`InventoryStore`].
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so both traits can be used as
//! `Arc<dyn LedgerStore>` / `Arc<dyn InventoryStore>`.

use crate::error::StoreError;
use crate::item::{Item, ItemId, ItemPatch, NewItem, ProjectionBatch};
use crate::loan::{LoanClosure, LoanEvent, LoanId, LoanQuery, LoanPage, LoanStatus, NewLoan};
use crate::{DateTime, Utc};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// A live subscription: yields the full current result set on every change.
///
/// An `Err` item reports a feed failure; the stream ends after it and the
/// consumer is expected to resubscribe.
pub type LiveQuery<T> = Pin<Box<dyn Stream<Item = Result<Vec<T>, StoreError>> + Send>>;

/// Append-only ledger of loan events.
pub trait LedgerStore: Send + Sync {
    /// Append a new active row and return it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn append(&self, loan: NewLoan) -> StoreFuture<'_, LoanEvent>;

    /// Fetch one row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    fn get(&self, id: LoanId) -> StoreFuture<'_, LoanEvent>;

    /// Run a filtered, newest-first, paged query.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or a row is malformed.
    fn query(&self, query: LoanQuery) -> StoreFuture<'_, LoanPage>;

    /// Close an open row: flip it to `returned` and heal its `itemRef`.
    ///
    /// The write is conditional on the row still being open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the row is no longer open, and
    /// [`StoreError::NotFound`] if it does not exist.
    fn close(&self, id: LoanId, closure: LoanClosure) -> StoreFuture<'_, LoanEvent>;

    /// Flip the row from `active` to `overdue`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the row is not `active`.
    fn mark_overdue(&self, id: LoanId, at: DateTime<Utc>) -> StoreFuture<'_, LoanEvent>;

    /// Best-effort backfill of the display name on an existing row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn backfill_display_name(&self, id: LoanId, display_name: String) -> StoreFuture<'_, ()>;

    /// Subscribe to a query's full result set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Subscription`] if the subscription cannot be opened.
    fn subscribe(&self, query: LoanQuery) -> StoreFuture<'_, LiveQuery<LoanEvent>>;

    /// Every open row whose `itemRef` is any of `refs`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn open_loans_for(&self, refs: Vec<String>) -> StoreFuture<'_, Vec<LoanEvent>> {
        Box::pin(async move {
            let page = self
                .query(LoanQuery::all().with_item_refs(refs).with_statuses(LoanStatus::OPEN))
                .await?;
            Ok(page.loans)
        })
    }
}

/// Current-state projection, one record per item.
pub trait InventoryStore: Send + Sync {
    /// Register a new item (inventory management only).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn create(&self, item: NewItem) -> StoreFuture<'_, Item>;

    /// Fetch one item.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    fn get(&self, id: ItemId) -> StoreFuture<'_, Item>;

    /// Every item, in store order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or a document is malformed.
    fn list(&self) -> StoreFuture<'_, Vec<Item>>;

    /// Apply a patch to one item (per-document atomic).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the item does not exist.
    fn update(&self, id: ItemId, patch: ItemPatch) -> StoreFuture<'_, Item>;

    /// Apply every patch in the batch, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] and applies nothing if any update fails.
    fn commit_batch(&self, batch: ProjectionBatch) -> StoreFuture<'_, Vec<Item>>;

    /// Subscribe to the full item list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Subscription`] if the subscription cannot be opened.
    fn subscribe(&self) -> StoreFuture<'_, LiveQuery<Item>>;
}
