//! Consistency sweep: compare the ledger against the projection.
//!
//! The ledger is authoritative. The audit only reports; repairs go through
//! [`Reconciler::resync`](crate::reconciler::Reconciler::resync).

use crate::metrics::SweepMetrics;
use chrono::{DateTime, Utc};
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::item::{Item, ItemId, ItemStatus};
use equipment_ledger_core::loan::{LoanEvent, LoanId, LoanQuery, LoanStatus};
use equipment_ledger_core::store::{InventoryStore, LedgerStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One disagreement between ledger and projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mismatch {
    /// An open row exists but the item is not marked loaned
    OpenLoanButItemNotLoaned {
        /// Open row
        loan_id: LoanId,
        /// Item
        item_id: ItemId,
        /// Projection status
        status: ItemStatus,
    },
    /// The item is loaned (or has a holder) with no open row
    LoanedItemWithoutOpenLoan {
        /// Item
        item_id: ItemId,
        /// Projection holder
        holder: Option<String>,
    },
    /// An open row references no known item
    OpenLoanForUnknownItem {
        /// Open row
        loan_id: LoanId,
        /// Its reference
        item_ref: String,
    },
    /// More than one open row for one item
    DuplicateOpenLoans {
        /// Item
        item_id: ItemId,
        /// All open rows, newest first
        loans: Vec<LoanId>,
    },
}

impl Mismatch {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::OpenLoanButItemNotLoaned { .. } => "open_loan_but_item_not_loaned",
            Self::LoanedItemWithoutOpenLoan { .. } => "loaned_item_without_open_loan",
            Self::OpenLoanForUnknownItem { .. } => "open_loan_for_unknown_item",
            Self::DuplicateOpenLoans { .. } => "duplicate_open_loans",
        }
    }
}

/// Result of an audit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// When the audit ran
    pub checked_at: Option<DateTime<Utc>>,
    /// Items examined
    pub items: usize,
    /// Open rows examined
    pub open_loans: usize,
    /// Disagreements found
    pub mismatches: Vec<Mismatch>,
}

impl AuditReport {
    /// Returns `true` if ledger and projection agree.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Periodic ledger/projection audit.
pub struct ConsistencySweep {
    ledger: Arc<dyn LedgerStore>,
    inventory: Arc<dyn InventoryStore>,
}

impl ConsistencySweep {
    /// Sweep over both stores.
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerStore>, inventory: Arc<dyn InventoryStore>) -> Self {
        Self { ledger, inventory }
    }

    /// Compare every open row with the projection.
    ///
    /// Open rows are attributed to items through each item's known
    /// reference strings, so rows written under an old reference are
    /// matched.
    ///
    /// # Errors
    ///
    /// Returns the store error if either read fails.
    #[tracing::instrument(skip(self))]
    pub async fn audit(&self, now: DateTime<Utc>) -> Result<AuditReport, StoreError> {
        let items = self.inventory.list().await?;
        let open = self.ledger.query(LoanQuery::open()).await?.loans;

        let mut by_reference: HashMap<String, usize> = HashMap::new();
        for (position, item) in items.iter().enumerate() {
            for reference in item.reference_strings() {
                by_reference.entry(reference).or_insert(position);
            }
        }

        let mut mismatches = Vec::new();
        let mut open_by_item: BTreeMap<usize, Vec<&LoanEvent>> = BTreeMap::new();
        for loan in &open {
            match by_reference.get(loan.item_ref.trim()) {
                Some(position) => open_by_item.entry(*position).or_default().push(loan),
                None => mismatches.push(Mismatch::OpenLoanForUnknownItem {
                    loan_id: loan.id.clone(),
                    item_ref: loan.item_ref.clone(),
                }),
            }
        }

        for (position, item) in items.iter().enumerate() {
            match open_by_item.get(&position).map(Vec::as_slice) {
                Some([]) | None => {
                    if item.status == ItemStatus::Loaned || item.current_holder.is_some() {
                        mismatches.push(Mismatch::LoanedItemWithoutOpenLoan {
                            item_id: item.id.clone(),
                            holder: item.current_holder.clone(),
                        });
                    }
                },
                Some(loans) => Self::check_open(item, loans, &mut mismatches),
            }
        }

        for mismatch in &mismatches {
            tracing::warn!(
                target: "equipment_ledger::anomaly",
                anomaly = mismatch.kind(),
                ?mismatch,
                "Ledger and projection disagree"
            );
        }
        SweepMetrics::record_mismatches(mismatches.len());
        tracing::info!(items = items.len(), open_loans = open.len(), mismatches = mismatches.len(), "Audit complete");

        Ok(AuditReport {
            checked_at: Some(now),
            items: items.len(),
            open_loans: open.len(),
            mismatches,
        })
    }

    fn check_open(item: &Item, loans: &[&LoanEvent], mismatches: &mut Vec<Mismatch>) {
        let mut loans = loans.to_vec();
        loans.sort_by(|a, b| LoanQuery::newest_first(a, b));

        if loans.len() > 1 {
            mismatches.push(Mismatch::DuplicateOpenLoans {
                item_id: item.id.clone(),
                loans: loans.iter().map(|l| l.id.clone()).collect(),
            });
        }
        if item.status != ItemStatus::Loaned {
            if let Some(newest) = loans.first() {
                mismatches.push(Mismatch::OpenLoanButItemNotLoaned {
                    loan_id: newest.id.clone(),
                    item_id: item.id.clone(),
                    status: item.status,
                });
            }
        }
    }

    /// Flip `active` rows past their due time to `overdue`.
    ///
    /// Returns the rows that were flipped. A row that fails to update is
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the store error if the query fails.
    #[tracing::instrument(skip(self))]
    pub async fn mark_overdue(&self, now: DateTime<Utc>) -> Result<Vec<LoanEvent>, StoreError> {
        let active = self
            .ledger
            .query(LoanQuery::all().with_statuses([LoanStatus::Active]))
            .await?
            .loans;

        let mut flipped = Vec::new();
        for loan in active {
            if !loan.expected_return_at.is_some_and(|due| due < now) {
                continue;
            }
            match self.ledger.mark_overdue(loan.id.clone(), now).await {
                Ok(updated) => flipped.push(updated),
                Err(StoreError::Conflict(reason)) => {
                    tracing::debug!(loan_id = %loan.id, reason, "Loan closed before it could be marked overdue");
                },
                Err(e) => tracing::warn!(loan_id = %loan.id, error = %e, "Failed to mark loan overdue"),
            }
        }

        SweepMetrics::record_overdue(flipped.len());
        if !flipped.is_empty() {
            tracing::info!(count = flipped.len(), "Loans marked overdue");
        }
        Ok(flipped)
    }
}
