//! A small school inventory used across tests.

use crate::memory_store::InMemoryDocumentStore;
use crate::mocks::base_time;
use chrono::{DateTime, Duration, Utc};
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::item::{Item, ItemId, NewItem};
use equipment_ledger_core::loan::{LoanEvent, NewLoan};
use equipment_ledger_core::store::{InventoryStore, LedgerStore};

/// Epson projector with a hyphenated scan code.
#[must_use]
pub fn projector() -> NewItem {
    NewItem::named("Proyector Epson")
        .with_brand_model("Epson", "PowerLite X49")
        .with_serial("X4K-00912")
        .with_scan_code("QR-0001")
}

/// Bluetooth speaker carrying a legacy seed reference.
#[must_use]
pub fn speaker() -> NewItem {
    NewItem::named("Parlante JBL")
        .with_brand_model("JBL", "Flip 5")
        .with_serial("JBL 5520 A")
        .with_scan_code("QR-0002")
        .with_alias("SEED-BRC-003")
}

/// Classroom tablet `n`.
#[must_use]
pub fn tablet(n: usize) -> NewItem {
    NewItem::named(format!("Tablet {n:02}"))
        .with_brand_model("Samsung", "Galaxy Tab A8")
        .with_serial(format!("TAB-{n:04}"))
        .with_scan_code(format!("QR-1{n:03}"))
}

/// Create every item in `items`.
///
/// # Errors
///
/// Returns the store error if a create fails.
pub async fn seed(store: &InMemoryDocumentStore, items: Vec<NewItem>) -> Result<Vec<Item>, StoreError> {
    let mut created = Vec::with_capacity(items.len());
    for item in items {
        created.push(store.create(item).await?);
    }
    Ok(created)
}

/// A loan draft for `item_ref`, loaned at `at`.
#[must_use]
pub fn loan_draft(item_ref: &str, borrower_key: &str, at: DateTime<Utc>) -> NewLoan {
    NewLoan {
        item_ref: ItemId::new(item_ref),
        item_display_name: None,
        borrower_key: borrower_key.to_string(),
        destination: String::new(),
        purpose: String::new(),
        classroom: None,
        expected_return_at: None,
        notes: None,
        loaned_at: at,
    }
}

/// Append a ledger row directly, as an older client version would have.
///
/// # Errors
///
/// Returns the store error if the append fails.
pub async fn legacy_loan(
    store: &InMemoryDocumentStore,
    item_ref: &str,
    borrower_key: &str,
    hours_ago: i64,
) -> Result<LoanEvent, StoreError> {
    store
        .append(loan_draft(item_ref, borrower_key, base_time() - Duration::hours(hours_ago)))
        .await
}
