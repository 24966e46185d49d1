//! The reconciler: ledger-before-projection writes.
//!
//! Every transition runs in two phases:
//!
//! 1. **Ledger** ([`Reconciler::append_ledger`], [`Reconciler::close_ledger`]):
//!    writes the loan row. Failure here fails the whole operation; nothing
//!    else has been written.
//! 2. **Projection** ([`Reconciler::apply_projection`]): updates the item
//!    record. Only callable with the [`LedgerReceipt`] produced by phase 1.
//!    Failure here is reported as [`SyncStatus::PendingSync`], because the
//!    ledger already reflects the transition.
//!
//! An item is never marked available while the ledger says it is out: if a
//! loan's projection update fails the item simply stays as it was, and
//! [`Reconciler::resync`] re-derives it from the ledger later.

use crate::config::LedgerConfig;
use crate::metrics::ReconcileMetrics;
use crate::resolver::{IdentityResolver, ResolveError};
use crate::retry::{RetryPolicy, retry_transient};
use crate::scan_session::{
    ConfirmDetails, SessionDispatcher, SessionMode, SessionOutcome, SessionRequest,
};
use chrono::{DateTime, Utc};
use equipment_ledger_core::catalog::MatchKind;
use equipment_ledger_core::environment::Clock;
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::item::{Item, ItemId, ItemPatch, ItemStatus, ProjectionBatch};
use equipment_ledger_core::loan::{LoanClosure, LoanEvent, LoanId, NewLoan};
use equipment_ledger_core::normalize::normalize_text;
use equipment_ledger_core::notify::{LedgerNotice, NoticeKind, Notifier};
use equipment_ledger_core::store::{InventoryStore, LedgerStore, StoreFuture};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const ANOMALY: &str = "equipment_ledger::anomaly";

/// Reconciler failures. Nothing has been written when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The reference resolves to no registered item
    #[error("item `{0}` is not registered")]
    ItemNotRegistered(String),

    /// A loan was requested without a borrower
    #[error("a borrower is required")]
    BorrowerKeyRequired,

    /// A return was requested without saying who brought the item back
    #[error("the person returning the item is required")]
    ReturnedByRequired,

    /// A classroom batch was requested without a classroom label
    #[error("a classroom label is required")]
    ClassroomLabelRequired,

    /// The item already has an open ledger row
    #[error("item {item_id} is already on loan ({loan_id})")]
    AlreadyOnLoan {
        /// Item
        item_id: ItemId,
        /// Open row
        loan_id: LoanId,
    },

    /// The item's projection is not `available`
    #[error("item {item_id} is {status}")]
    ItemUnavailable {
        /// Item
        item_id: ItemId,
        /// Current projection status
        status: ItemStatus,
    },

    /// A read or the ledger write failed; retry the operation
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl From<ResolveError> for ReconcileError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::NotFound(reference) => Self::ItemNotRegistered(reference),
            ResolveError::EmptyReference => Self::ItemNotRegistered(String::new()),
            ResolveError::Store(e) => Self::StoreUnavailable(e),
        }
    }
}

/// Whether the projection caught up with the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    /// Ledger and projection both written
    Synced,
    /// Ledger written, projection update failed; resync later
    PendingSync {
        /// Last projection error
        reason: String,
    },
}

impl SyncStatus {
    /// Returns `true` for [`SyncStatus::Synced`].
    #[must_use]
    pub const fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }
}

/// Non-fatal irregularities found while returning an item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnAnomaly {
    /// No open ledger row references the item; the projection was updated alone
    NoActiveLoanFound,
    /// The open row was closed by someone else between read and write
    ClosedConcurrently {
        /// The row that was already closed
        loan_id: LoanId,
    },
}

impl ReturnAnomaly {
    const fn kind(&self) -> &'static str {
        match self {
            Self::NoActiveLoanFound => "no_active_loan_found",
            Self::ClosedConcurrently { .. } => "closed_concurrently",
        }
    }
}

/// Proof that the ledger phase of a transition completed.
///
/// Only [`Reconciler::append_ledger`] and [`Reconciler::close_ledger`] can
/// construct one, so a projection write cannot precede its ledger write.
#[derive(Debug, Clone)]
pub struct LedgerReceipt {
    item: Item,
    loan: Option<LoanEvent>,
    patch: ItemPatch,
    anomaly: Option<ReturnAnomaly>,
}

impl LedgerReceipt {
    /// The item as resolved before the write.
    #[must_use]
    pub const fn item(&self) -> &Item {
        &self.item
    }

    /// The ledger row written, if any.
    #[must_use]
    pub const fn loan(&self) -> Option<&LoanEvent> {
        self.loan.as_ref()
    }

    /// The projection update this ledger write implies.
    #[must_use]
    pub const fn patch(&self) -> &ItemPatch {
        &self.patch
    }
}

/// A single-item loan request.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct LoanRequest {
    /// Raw item reference (scan, serial, name, id)
    pub item_ref: String,
    /// Email or other borrower key
    pub borrower_key: String,
    /// Free-text destination
    pub destination: String,
    /// Free-text purpose
    pub purpose: String,
    /// Free-text notes
    pub notes: Option<String>,
    /// When the item is due back
    pub expected_return_at: Option<DateTime<Utc>>,
}

impl LoanRequest {
    /// Loan `item_ref` to `borrower_key`.
    #[must_use]
    pub fn new(item_ref: impl Into<String>, borrower_key: impl Into<String>) -> Self {
        Self {
            item_ref: item_ref.into(),
            borrower_key: borrower_key.into(),
            ..Self::default()
        }
    }

    /// Set destination.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Set purpose.
    #[must_use]
    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    /// Set notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Set the due time.
    #[must_use]
    pub const fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.expected_return_at = Some(at);
        self
    }
}

/// A single-item return request.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ReturnRequest {
    /// Raw item reference
    pub item_ref: String,
    /// Who brought it back
    pub returned_by: String,
    /// Operator receiving it
    pub received_by: Option<String>,
    /// Condition notes
    pub notes: Option<String>,
}

impl ReturnRequest {
    /// Return `item_ref`, brought back by `returned_by`.
    #[must_use]
    pub fn new(item_ref: impl Into<String>, returned_by: impl Into<String>) -> Self {
        Self {
            item_ref: item_ref.into(),
            returned_by: returned_by.into(),
            ..Self::default()
        }
    }

    /// Set the receiving operator.
    #[must_use]
    pub fn received_by(mut self, operator: impl Into<String>) -> Self {
        self.received_by = Some(operator.into());
        self
    }

    /// Set notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Direction of a classroom batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    /// Lend every item to the classroom
    Loan,
    /// Take every item back from the classroom
    Return,
}

/// A multi-item classroom assignment or collection.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassroomBatchRequest {
    /// Raw scanned references, in scan order
    pub refs: Vec<String>,
    /// Classroom label, e.g. "201"
    pub classroom_label: String,
    /// Loan or return
    pub mode: BatchMode,
    /// Purpose for loans
    pub purpose: String,
    /// Notes applied to every row
    pub notes: Option<String>,
    /// Due time for loans
    pub expected_return_at: Option<DateTime<Utc>>,
    /// Operator receiving a returned batch
    pub received_by: Option<String>,
}

impl ClassroomBatchRequest {
    /// Lend `refs` to `classroom_label`.
    #[must_use]
    pub fn loan(refs: Vec<String>, classroom_label: impl Into<String>) -> Self {
        Self {
            refs,
            classroom_label: classroom_label.into(),
            mode: BatchMode::Loan,
            purpose: String::new(),
            notes: None,
            expected_return_at: None,
            received_by: None,
        }
    }

    /// Take `refs` back from `classroom_label`.
    #[must_use]
    pub fn returning(refs: Vec<String>, classroom_label: impl Into<String>) -> Self {
        Self {
            mode: BatchMode::Return,
            ..Self::loan(refs, classroom_label)
        }
    }
}

/// Result of [`Reconciler::register_loan`].
#[derive(Clone, Debug, PartialEq)]
pub struct LoanOutcome {
    /// The appended row
    pub loan: LoanEvent,
    /// The item after the projection update (or as it would be, if pending)
    pub item: Item,
    /// Projection state
    pub sync: SyncStatus,
    /// Which lookup step resolved the reference
    pub matched_by: MatchKind,
}

/// Result of [`Reconciler::register_return`].
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnOutcome {
    /// The item after the projection update (or as it would be, if pending)
    pub item: Item,
    /// The closed row, if one was found and closed by this call
    pub closed: Option<LoanEvent>,
    /// Irregularity found along the way
    pub anomaly: Option<ReturnAnomaly>,
    /// Projection state
    pub sync: SyncStatus,
    /// Which lookup step resolved the reference
    pub matched_by: MatchKind,
}

/// Why a batch reference was not processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchFailureReason {
    /// The reference resolves to no registered item
    NotRegistered,
    /// An earlier reference in the batch resolved to the same item
    DuplicateItem {
        /// The shared item
        item_id: ItemId,
    },
    /// The item already has an open row (loans only)
    AlreadyOnLoan {
        /// Open row
        loan_id: LoanId,
    },
    /// The item's projection is not available (loans only)
    ItemUnavailable {
        /// Current status
        status: ItemStatus,
    },
    /// The open row belongs to another borrower (returns only); return the
    /// item on its own instead
    LoanedElsewhere {
        /// The open row
        loan_id: LoanId,
        /// Who holds it
        borrower_key: String,
    },
    /// The ledger read or write failed
    Ledger(StoreError),
}

/// One failed batch reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchFailure {
    /// The raw reference as scanned
    pub reference: String,
    /// Why it failed
    pub reason: BatchFailureReason,
}

/// Partitioned result of [`Reconciler::register_classroom_batch`].
#[derive(Clone, Debug, PartialEq)]
pub struct BatchOutcome {
    /// Classroom label
    pub classroom: String,
    /// Loan or return
    pub mode: BatchMode,
    /// Items whose ledger write succeeded, as projected
    pub succeeded: Vec<Item>,
    /// Ledger rows appended or closed
    pub loans: Vec<LoanEvent>,
    /// References that were not processed, in scan order
    pub failed: Vec<BatchFailure>,
    /// Return irregularities, per item
    pub anomalies: Vec<(ItemId, ReturnAnomaly)>,
    /// State of the single batched projection write
    pub sync: SyncStatus,
}

impl BatchOutcome {
    /// The raw references that failed, in scan order.
    #[must_use]
    pub fn failed_refs(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.reference.as_str()).collect()
    }
}

/// Result of [`Reconciler::resync`].
#[derive(Clone, Debug, PartialEq)]
pub struct ResyncOutcome {
    /// The item after resync
    pub item: Item,
    /// Whether the projection had to be rewritten
    pub changed: bool,
}

async fn bounded<T>(limit: Duration, fut: StoreFuture<'_, T>) -> Result<T, StoreError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Orchestrates identity resolution, ledger writes and projection updates.
pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    inventory: Arc<dyn InventoryStore>,
    resolver: IdentityResolver,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    write_timeout: Duration,
    batch_concurrency: usize,
    projection_retry: RetryPolicy,
    notify_timeout: Duration,
}

impl Reconciler {
    /// Wire a reconciler.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        inventory: Arc<dyn InventoryStore>,
        resolver: IdentityResolver,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            ledger,
            inventory,
            resolver,
            notifier,
            clock,
            write_timeout: config.write_timeout,
            batch_concurrency: config.batch_concurrency.max(1),
            projection_retry: config.projection_retry.clone(),
            notify_timeout: config.notify_timeout,
        }
    }

    /// The resolver used for lookups.
    #[must_use]
    pub const fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Lend one item.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::BorrowerKeyRequired`] for a blank borrower
    /// - [`ReconcileError::ItemNotRegistered`] if the reference resolves to nothing
    /// - [`ReconcileError::AlreadyOnLoan`] if an open row exists
    /// - [`ReconcileError::ItemUnavailable`] if the item is not available
    /// - [`ReconcileError::StoreUnavailable`] if a read or the ledger write fails
    #[tracing::instrument(skip(self, request), fields(item_ref = %request.item_ref))]
    pub async fn register_loan(&self, request: LoanRequest) -> Result<LoanOutcome, ReconcileError> {
        let started = Instant::now();
        let borrower = request.borrower_key.trim();
        if borrower.is_empty() {
            return Err(ReconcileError::BorrowerKeyRequired);
        }

        let resolution = self.resolver.resolve(&request.item_ref).await?;
        let item = resolution.item;

        let open = self
            .open_loans(&item)
            .await
            .map_err(ReconcileError::StoreUnavailable)?;
        if let Some(existing) = open.first() {
            return Err(ReconcileError::AlreadyOnLoan {
                item_id: item.id,
                loan_id: existing.id.clone(),
            });
        }
        if item.status != ItemStatus::Available {
            return Err(ReconcileError::ItemUnavailable {
                item_id: item.id,
                status: item.status,
            });
        }

        let draft = NewLoan {
            item_ref: item.id.clone(),
            item_display_name: Some(item.display_label().to_string()),
            borrower_key: borrower.to_string(),
            destination: request.destination.trim().to_string(),
            purpose: request.purpose.trim().to_string(),
            classroom: None,
            expected_return_at: request.expected_return_at,
            notes: non_empty(request.notes.as_deref()),
            loaned_at: self.clock.now(),
        };
        let (loan, receipt) = self
            .append_ledger(&item, draft)
            .await
            .map_err(ReconcileError::StoreUnavailable)?;
        self.check_duplicate_open(&item, &loan.id).await;

        let (item, sync) = self.apply_projection(&receipt).await;

        ReconcileMetrics::record_loans(1);
        tracing::info!(
            item_id = %item.id,
            loan_id = %loan.id,
            borrower = %loan.borrower_key,
            matched_by = resolution.kind.as_str(),
            synced = sync.is_synced(),
            "Loan registered"
        );
        self.notify(LedgerNotice {
            kind: NoticeKind::LoanRegistered,
            items: vec![item.id.clone()],
            loans: vec![loan.id.clone()],
            borrower_key: Some(loan.borrower_key.clone()),
            at: loan.loaned_at,
        });
        ReconcileMetrics::record_duration("register_loan", started.elapsed());

        Ok(LoanOutcome {
            loan,
            item,
            sync,
            matched_by: resolution.kind,
        })
    }

    /// Take one item back.
    ///
    /// Closes the most recent open row referencing the item under any of
    /// its known reference strings and heals that row's `itemRef` to the
    /// canonical id. With no open row the projection is still updated and a
    /// [`ReturnAnomaly::NoActiveLoanFound`] is reported.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::ReturnedByRequired`] for a blank `returned_by`
    /// - [`ReconcileError::ItemNotRegistered`] if the reference resolves to nothing
    /// - [`ReconcileError::StoreUnavailable`] if a read or the ledger write fails
    #[tracing::instrument(skip(self, request), fields(item_ref = %request.item_ref))]
    pub async fn register_return(&self, request: ReturnRequest) -> Result<ReturnOutcome, ReconcileError> {
        let started = Instant::now();
        let returned_by = request.returned_by.trim();
        if returned_by.is_empty() {
            return Err(ReconcileError::ReturnedByRequired);
        }

        let resolution = self.resolver.resolve(&request.item_ref).await?;
        let item = resolution.item;

        let open = self
            .open_loans(&item)
            .await
            .map_err(ReconcileError::StoreUnavailable)?;
        let closure = LoanClosure {
            canonical_ref: item.id.clone(),
            returned_at: self.clock.now(),
            returned_by: returned_by.to_string(),
            received_by: non_empty(request.received_by.as_deref()),
            notes: non_empty(request.notes.as_deref()),
        };
        let receipt = self
            .close_ledger(&item, open, closure)
            .await
            .map_err(ReconcileError::StoreUnavailable)?;

        let (item, sync) = self.apply_projection(&receipt).await;

        ReconcileMetrics::record_returns(1);
        if receipt.anomaly.is_none() {
            tracing::info!(
                item_id = %item.id,
                loan_id = ?receipt.loan.as_ref().map(|l| l.id.as_str()),
                matched_by = resolution.kind.as_str(),
                synced = sync.is_synced(),
                "Return registered"
            );
        }
        self.notify(LedgerNotice {
            kind: NoticeKind::ReturnRegistered,
            items: vec![item.id.clone()],
            loans: receipt.loan.iter().map(|l| l.id.clone()).collect(),
            borrower_key: receipt.loan.as_ref().map(|l| l.borrower_key.clone()),
            at: receipt.patch.updated_at,
        });
        ReconcileMetrics::record_duration("register_return", started.elapsed());

        Ok(ReturnOutcome {
            item,
            closed: receipt.loan,
            anomaly: receipt.anomaly,
            sync,
            matched_by: resolution.kind,
        })
    }

    /// Lend or collect many items for one classroom.
    ///
    /// References are de-duplicated (first occurrence kept) and resolved
    /// against one snapshot. Ledger writes run per item with bounded
    /// concurrency; every item whose ledger write succeeded goes into one
    /// batched projection write. Failures are reported per reference in
    /// [`BatchOutcome::failed`], never as an error.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::ClassroomLabelRequired`] for a blank label
    /// - [`ReconcileError::StoreUnavailable`] if no inventory snapshot can be
    ///   obtained at all
    #[tracing::instrument(skip(self, request), fields(classroom = %request.classroom_label, refs = request.refs.len()))]
    pub async fn register_classroom_batch(
        &self,
        request: ClassroomBatchRequest,
    ) -> Result<BatchOutcome, ReconcileError> {
        let started = Instant::now();
        let label = request.classroom_label.trim();
        if label.is_empty() {
            return Err(ReconcileError::ClassroomLabelRequired);
        }

        let mut refs: Vec<String> = Vec::with_capacity(request.refs.len());
        for reference in &request.refs {
            if !refs.contains(reference) {
                refs.push(reference.clone());
            }
        }

        let snapshot = self.resolver.snapshot().await?;
        let now = self.clock.now();

        let mut failed: Vec<(usize, BatchFailure)> = Vec::new();
        let mut candidates: Vec<(usize, String, Item)> = Vec::new();
        let mut seen: HashMap<ItemId, usize> = HashMap::new();
        for (position, reference) in refs.into_iter().enumerate() {
            match snapshot.resolve(&reference) {
                Ok(resolution) => {
                    if seen.contains_key(&resolution.item.id) {
                        failed.push((
                            position,
                            BatchFailure {
                                reference,
                                reason: BatchFailureReason::DuplicateItem {
                                    item_id: resolution.item.id,
                                },
                            },
                        ));
                    } else {
                        seen.insert(resolution.item.id.clone(), position);
                        candidates.push((position, reference, resolution.item));
                    }
                },
                Err(_) => failed.push((
                    position,
                    BatchFailure {
                        reference,
                        reason: BatchFailureReason::NotRegistered,
                    },
                )),
            }
        }

        let request = &request;
        let results: Vec<(usize, String, Result<LedgerReceipt, BatchFailureReason>)> =
            stream::iter(candidates)
                .map(|(position, reference, item)| async move {
                    let result = match request.mode {
                        BatchMode::Loan => self.batch_loan_entry(&item, label, request, now).await,
                        BatchMode::Return => self.batch_return_entry(&item, label, request, now).await,
                    };
                    (position, reference, result)
                })
                .buffered(self.batch_concurrency)
                .collect()
                .await;

        let mut receipts = Vec::with_capacity(results.len());
        for (position, reference, result) in results {
            match result {
                Ok(receipt) => receipts.push(receipt),
                Err(reason) => {
                    tracing::warn!(reference = %reference, ?reason, "Batch item failed");
                    failed.push((position, BatchFailure { reference, reason }));
                },
            }
        }
        failed.sort_by_key(|(position, _)| *position);
        let failed: Vec<BatchFailure> = failed.into_iter().map(|(_, f)| f).collect();

        let (succeeded, sync) = if receipts.is_empty() {
            (Vec::new(), SyncStatus::Synced)
        } else {
            self.apply_projection_batch(&receipts).await
        };

        let loans: Vec<LoanEvent> = receipts.iter().filter_map(|r| r.loan.clone()).collect();
        let anomalies: Vec<(ItemId, ReturnAnomaly)> = receipts
            .iter()
            .filter_map(|r| r.anomaly.clone().map(|a| (r.item.id.clone(), a)))
            .collect();

        match request.mode {
            BatchMode::Loan => ReconcileMetrics::record_loans(loans.len()),
            BatchMode::Return => ReconcileMetrics::record_returns(receipts.len()),
        }
        ReconcileMetrics::record_batch_failures(failed.len());
        tracing::info!(
            classroom = label,
            mode = ?request.mode,
            succeeded = succeeded.len(),
            failed = failed.len(),
            synced = sync.is_synced(),
            "Classroom batch processed"
        );
        if !succeeded.is_empty() {
            self.notify(LedgerNotice {
                kind: NoticeKind::ClassroomBatch,
                items: succeeded.iter().map(|i| i.id.clone()).collect(),
                loans: loans.iter().map(|l| l.id.clone()).collect(),
                borrower_key: Some(label.to_string()),
                at: now,
            });
        }
        ReconcileMetrics::record_duration("register_classroom_batch", started.elapsed());

        Ok(BatchOutcome {
            classroom: label.to_string(),
            mode: request.mode,
            succeeded,
            loans,
            failed,
            anomalies,
            sync,
        })
    }

    /// Re-derive an item's projection from the ledger.
    ///
    /// With an open row the item becomes loaned to that row's borrower;
    /// without one a loaned item becomes available. This is the retry path
    /// for [`SyncStatus::PendingSync`].
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::ItemNotRegistered`] if the reference resolves to nothing
    /// - [`ReconcileError::StoreUnavailable`] if a read or the write fails
    #[tracing::instrument(skip(self))]
    pub async fn resync(&self, item_ref: &str) -> Result<ResyncOutcome, ReconcileError> {
        self.resolver.cache().invalidate();
        let resolved = self.resolver.resolve(item_ref).await?.item;
        let current = bounded(self.write_timeout, self.inventory.get(resolved.id.clone()))
            .await
            .map_err(ReconcileError::StoreUnavailable)?;
        let open = self
            .open_loans(&current)
            .await
            .map_err(ReconcileError::StoreUnavailable)?;
        let now = self.clock.now();

        let patch = match open.first() {
            Some(loan)
                if current.status == ItemStatus::Loaned
                    && current.current_holder.as_deref() == Some(loan.borrower_key.as_str()) =>
            {
                None
            },
            Some(loan) => Some(ItemPatch {
                updated_at: now,
                ..ItemPatch::loaned(loan.borrower_key.clone(), Self::location_for(loan), loan.loaned_at)
            }),
            None if current.status == ItemStatus::Loaned || current.current_holder.is_some() => {
                Some(ItemPatch {
                    last_return_at: None,
                    ..ItemPatch::available(now)
                })
            },
            None => None,
        };

        let Some(patch) = patch else {
            tracing::debug!(item_id = %current.id, "Projection already matches ledger");
            return Ok(ResyncOutcome {
                item: current,
                changed: false,
            });
        };

        let item = self
            .update_with_retry(&current.id, &patch)
            .await
            .map_err(ReconcileError::StoreUnavailable)?;
        self.resolver.cache().invalidate();
        tracing::info!(
            item_id = %item.id,
            status = %item.status,
            holder = ?item.current_holder,
            "Projection resynced from ledger"
        );
        Ok(ResyncOutcome {
            item,
            changed: true,
        })
    }

    /// Ledger phase of a loan: append the row.
    ///
    /// # Errors
    ///
    /// Returns the store error if the append fails or times out.
    pub async fn append_ledger(
        &self,
        item: &Item,
        draft: NewLoan,
    ) -> Result<(LoanEvent, LedgerReceipt), StoreError> {
        let loan = bounded(self.write_timeout, self.ledger.append(draft)).await?;
        let patch = ItemPatch {
            updated_at: self.clock.now(),
            ..ItemPatch::loaned(loan.borrower_key.clone(), Self::location_for(&loan), loan.loaned_at)
        };
        tracing::debug!(loan_id = %loan.id, item_id = %item.id, "Ledger row appended");

        let receipt = LedgerReceipt {
            item: item.clone(),
            loan: Some(loan.clone()),
            patch,
            anomaly: None,
        };
        Ok((loan, receipt))
    }

    /// Ledger phase of a return: close the most recent open row in `open`.
    ///
    /// An empty `open` list, or a row closed concurrently by another
    /// operator, yields a receipt carrying a [`ReturnAnomaly`].
    ///
    /// # Errors
    ///
    /// Returns the store error if the close fails for any reason other than
    /// a conflict.
    pub async fn close_ledger(
        &self,
        item: &Item,
        open: Vec<LoanEvent>,
        closure: LoanClosure,
    ) -> Result<LedgerReceipt, StoreError> {
        let patch = ItemPatch::available(closure.returned_at);
        let mut open = open.into_iter();

        let Some(target) = open.next() else {
            let anomaly = ReturnAnomaly::NoActiveLoanFound;
            ReconcileMetrics::record_anomaly(anomaly.kind());
            tracing::warn!(
                target: ANOMALY,
                anomaly = anomaly.kind(),
                item_id = %item.id,
                references = ?item.reference_strings(),
                "Return without an open ledger row; projection updated alone"
            );
            return Ok(LedgerReceipt {
                item: item.clone(),
                loan: None,
                patch,
                anomaly: Some(anomaly),
            });
        };

        let remaining: Vec<String> = open.map(|l| l.id.to_string()).collect();
        if !remaining.is_empty() {
            ReconcileMetrics::record_anomaly("duplicate_active_loan");
            tracing::warn!(
                target: ANOMALY,
                anomaly = "duplicate_active_loan",
                item_id = %item.id,
                closing = %target.id,
                still_open = ?remaining,
                "Item has more than one open ledger row"
            );
        }

        match bounded(self.write_timeout, self.ledger.close(target.id.clone(), closure)).await {
            Ok(closed) => {
                if closed.item_ref != target.item_ref {
                    tracing::info!(
                        loan_id = %closed.id,
                        from = %target.item_ref,
                        to = %closed.item_ref,
                        "Healed ledger item reference"
                    );
                }
                if closed.item_display_name.is_none() {
                    self.backfill_display_name(&closed, item).await;
                }
                Ok(LedgerReceipt {
                    item: item.clone(),
                    loan: Some(closed),
                    patch,
                    anomaly: None,
                })
            },
            Err(StoreError::Conflict(reason)) => {
                let anomaly = ReturnAnomaly::ClosedConcurrently {
                    loan_id: target.id.clone(),
                };
                ReconcileMetrics::record_anomaly(anomaly.kind());
                tracing::warn!(
                    target: ANOMALY,
                    anomaly = anomaly.kind(),
                    item_id = %item.id,
                    loan_id = %target.id,
                    reason,
                    "Ledger row was closed concurrently; treating as returned"
                );
                Ok(LedgerReceipt {
                    item: item.clone(),
                    loan: None,
                    patch,
                    anomaly: Some(anomaly),
                })
            },
            Err(e) => Err(e),
        }
    }

    /// Projection phase: apply the update implied by a ledger write.
    ///
    /// Transient failures are retried. Returns the projected item and
    /// whether the write landed.
    pub async fn apply_projection(&self, receipt: &LedgerReceipt) -> (Item, SyncStatus) {
        let result = self.update_with_retry(&receipt.item.id, &receipt.patch).await;
        self.resolver.cache().invalidate();

        match result {
            Ok(item) => (item, SyncStatus::Synced),
            Err(e) => {
                ReconcileMetrics::record_pending_sync("update");
                tracing::warn!(
                    item_id = %receipt.item.id,
                    loan_id = ?receipt.loan.as_ref().map(|l| l.id.as_str()),
                    error = %e,
                    "Ledger recorded, projection pending sync"
                );
                (
                    receipt.item.patched(&receipt.patch),
                    SyncStatus::PendingSync {
                        reason: e.to_string(),
                    },
                )
            },
        }
    }

    /// Projection phase for many receipts: one all-or-nothing batch write.
    pub async fn apply_projection_batch(&self, receipts: &[LedgerReceipt]) -> (Vec<Item>, SyncStatus) {
        let mut batch = ProjectionBatch::new();
        for receipt in receipts {
            batch.push(receipt.item.id.clone(), receipt.patch.clone());
        }

        let result = retry_transient(
            &self.projection_retry,
            "projection_batch",
            || bounded(self.write_timeout, self.inventory.commit_batch(batch.clone())),
            StoreError::is_transient,
        )
        .await;
        self.resolver.cache().invalidate();

        match result {
            Ok(items) => (items, SyncStatus::Synced),
            Err(e) => {
                ReconcileMetrics::record_pending_sync("batch");
                tracing::warn!(
                    items = receipts.len(),
                    error = %e,
                    "Ledger recorded, batched projection pending sync"
                );
                (
                    receipts.iter().map(|r| r.item.patched(&r.patch)).collect(),
                    SyncStatus::PendingSync {
                        reason: e.to_string(),
                    },
                )
            },
        }
    }

    async fn batch_loan_entry(
        &self,
        item: &Item,
        label: &str,
        request: &ClassroomBatchRequest,
        now: DateTime<Utc>,
    ) -> Result<LedgerReceipt, BatchFailureReason> {
        let open = self.open_loans(item).await.map_err(BatchFailureReason::Ledger)?;
        if let Some(existing) = open.first() {
            return Err(BatchFailureReason::AlreadyOnLoan {
                loan_id: existing.id.clone(),
            });
        }
        if item.status != ItemStatus::Available {
            return Err(BatchFailureReason::ItemUnavailable { status: item.status });
        }

        let draft = NewLoan {
            item_ref: item.id.clone(),
            item_display_name: Some(item.display_label().to_string()),
            borrower_key: label.to_string(),
            destination: "classroom".to_string(),
            purpose: request.purpose.trim().to_string(),
            classroom: Some(label.to_string()),
            expected_return_at: request.expected_return_at,
            notes: non_empty(request.notes.as_deref()),
            loaned_at: now,
        };
        let (loan, receipt) = self
            .append_ledger(item, draft)
            .await
            .map_err(BatchFailureReason::Ledger)?;
        self.check_duplicate_open(item, &loan.id).await;
        Ok(receipt)
    }

    async fn batch_return_entry(
        &self,
        item: &Item,
        label: &str,
        request: &ClassroomBatchRequest,
        now: DateTime<Utc>,
    ) -> Result<LedgerReceipt, BatchFailureReason> {
        let open = self.open_loans(item).await.map_err(BatchFailureReason::Ledger)?;
        let classroom = normalize_text(label);
        let (ours, elsewhere): (Vec<LoanEvent>, Vec<LoanEvent>) = open.into_iter().partition(|loan| {
            loan.classroom_label()
                .map_or_else(|| normalize_text(&loan.borrower_key), normalize_text)
                == classroom
        });
        if ours.is_empty() {
            if let Some(held) = elsewhere.into_iter().next() {
                ReconcileMetrics::record_anomaly("batch_borrower_mismatch");
                tracing::warn!(
                    target: ANOMALY,
                    anomaly = "batch_borrower_mismatch",
                    item_id = %item.id,
                    loan_id = %held.id,
                    borrower = %held.borrower_key,
                    classroom = label,
                    "Batch return scanned an item lent to someone else; left open"
                );
                return Err(BatchFailureReason::LoanedElsewhere {
                    loan_id: held.id,
                    borrower_key: held.borrower_key,
                });
            }
        }

        let closure = LoanClosure {
            canonical_ref: item.id.clone(),
            returned_at: now,
            returned_by: label.to_string(),
            received_by: non_empty(request.received_by.as_deref()),
            notes: non_empty(request.notes.as_deref()),
        };
        self.close_ledger(item, ours, closure)
            .await
            .map_err(BatchFailureReason::Ledger)
    }

    async fn open_loans(&self, item: &Item) -> Result<Vec<LoanEvent>, StoreError> {
        bounded(
            self.write_timeout,
            self.ledger.open_loans_for(item.reference_strings()),
        )
        .await
    }

    async fn update_with_retry(&self, id: &ItemId, patch: &ItemPatch) -> Result<Item, StoreError> {
        retry_transient(
            &self.projection_retry,
            "projection_update",
            || bounded(self.write_timeout, self.inventory.update(id.clone(), patch.clone())),
            StoreError::is_transient,
        )
        .await
    }

    /// Detect a concurrent duplicate loan right after appending.
    async fn check_duplicate_open(&self, item: &Item, appended: &LoanId) {
        match self.open_loans(item).await {
            Ok(open) if open.len() > 1 => {
                ReconcileMetrics::record_anomaly("duplicate_active_loan");
                tracing::warn!(
                    target: ANOMALY,
                    anomaly = "duplicate_active_loan",
                    item_id = %item.id,
                    appended = %appended,
                    open = ?open.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
                    "Concurrent loan detected for the same item"
                );
            },
            Ok(_) => {},
            Err(e) => tracing::debug!(error = %e, "Post-append duplicate check skipped"),
        }
    }

    async fn backfill_display_name(&self, loan: &LoanEvent, item: &Item) {
        let name = item.display_label().to_string();
        if let Err(e) = bounded(
            self.write_timeout,
            self.ledger.backfill_display_name(loan.id.clone(), name),
        )
        .await
        {
            tracing::debug!(loan_id = %loan.id, error = %e, "Display name backfill skipped");
        }
    }

    fn location_for(loan: &LoanEvent) -> Option<String> {
        loan.classroom_label()
            .map(str::to_string)
            .or_else(|| non_empty(Some(&loan.destination)))
    }

    fn notify(&self, notice: LedgerNotice) {
        let notifier = Arc::clone(&self.notifier);
        let limit = self.notify_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(limit, notifier.notify(notice)).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => tracing::warn!(error = %e, "Notification failed"),
                Err(_) => tracing::warn!(timeout_ms = limit.as_millis(), "Notification timed out"),
            }
        });
    }
}

impl SessionDispatcher for Reconciler {
    fn lookup(&self, reference: String) -> BoxFuture<'_, Option<Item>> {
        Box::pin(async move {
            self.resolver
                .resolve(&reference)
                .await
                .ok()
                .map(|resolution| resolution.item)
        })
    }

    fn dispatch(&self, request: SessionRequest) -> BoxFuture<'_, SessionOutcome> {
        Box::pin(async move {
            let SessionRequest {
                mode,
                mut refs,
                details,
            } = request;

            match (mode, details) {
                (
                    SessionMode::SingleLoan,
                    ConfirmDetails::Loan {
                        borrower_key,
                        destination,
                        purpose,
                        notes,
                        expected_return_at,
                    },
                ) => {
                    let request = LoanRequest {
                        item_ref: refs.pop().unwrap_or_default(),
                        borrower_key,
                        destination,
                        purpose,
                        notes,
                        expected_return_at,
                    };
                    match self.register_loan(request).await {
                        Ok(outcome) => SessionOutcome::Loaned(Box::new(outcome)),
                        Err(e) => SessionOutcome::Rejected(e),
                    }
                },
                (
                    SessionMode::SingleReturn,
                    ConfirmDetails::Return {
                        returned_by,
                        received_by,
                        notes,
                    },
                ) => {
                    let request = ReturnRequest {
                        item_ref: refs.pop().unwrap_or_default(),
                        returned_by,
                        received_by,
                        notes,
                    };
                    match self.register_return(request).await {
                        Ok(outcome) => SessionOutcome::Returned(Box::new(outcome)),
                        Err(e) => SessionOutcome::Rejected(e),
                    }
                },
                (
                    SessionMode::ClassroomBatch,
                    ConfirmDetails::Classroom {
                        classroom_label,
                        direction,
                        purpose,
                        notes,
                    },
                ) => {
                    let request = ClassroomBatchRequest {
                        purpose,
                        notes,
                        mode: direction,
                        ..ClassroomBatchRequest::loan(refs, classroom_label)
                    };
                    match self.register_classroom_batch(request).await {
                        Ok(outcome) => SessionOutcome::Batch(Box::new(outcome)),
                        Err(e) => SessionOutcome::Rejected(e),
                    }
                },
                (mode, details) => {
                    tracing::warn!(?mode, ?details, "Confirmation does not match session mode");
                    SessionOutcome::Cancelled
                },
            }
        })
    }
}
