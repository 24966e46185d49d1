//! Ledger records: append-only loan/return events.
//!
//! A [`LoanEvent`] is created once when a loan is requested and afterwards
//! only transitions `active → returned` or `active → overdue`. The single
//! other permitted edit is the best-effort display backfill
//! ([`LoanEvent::item_display_name`]).

use crate::item::ItemId;
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Store-assigned identifier of a ledger row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoanId(String);

impl LoanId {
    /// Create a new `LoanId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the loan ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LoanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LoanId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LoanId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a ledger row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    /// Out with the borrower
    Active,
    /// Back in the pool
    Returned,
    /// Still out past `expectedReturnAt`
    Overdue,
}

impl LoanStatus {
    /// An open loan is one the item has not come back from yet.
    ///
    /// Overdue rows are open: they block new loans and are closed by returns.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Active | Self::Overdue)
    }

    /// Database/document string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Returned => "returned",
            Self::Overdue => "overdue",
        }
    }

    /// Statuses considered open.
    pub const OPEN: [Self; 2] = [Self::Active, Self::Overdue];
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row.
///
/// Required fields: `id`, `itemRef`, `borrowerKey`, `loanedAt`, `status`,
/// `createdAt`, `updatedAt`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanEvent {
    /// Store-assigned identifier
    pub id: LoanId,
    /// Item reference at write time; may be a stale or historical string
    pub item_ref: String,
    /// Email or classroom label
    pub borrower_key: String,
    /// Free-text destination ("classroom" for batch loans)
    #[serde(default)]
    pub destination: String,
    /// Free-text purpose
    #[serde(default)]
    pub purpose: String,
    /// Classroom label for batch loans
    #[serde(default)]
    pub classroom: Option<String>,
    /// Display name backfilled after resolution
    #[serde(default)]
    pub item_display_name: Option<String>,
    /// When the loan started
    pub loaned_at: DateTime<Utc>,
    /// When the item is due back
    #[serde(default)]
    pub expected_return_at: Option<DateTime<Utc>>,
    /// When the item came back
    #[serde(default)]
    pub returned_at: Option<DateTime<Utc>>,
    /// Who brought it back
    #[serde(default)]
    pub returned_by: Option<String>,
    /// Operator who received it
    #[serde(default)]
    pub received_by: Option<String>,
    /// Lifecycle state
    pub status: LoanStatus,
    /// Free-text notes
    #[serde(default)]
    pub notes: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl LoanEvent {
    /// Returns `true` when the loan has not been closed.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// The timestamp this row sorts by on a timeline.
    #[must_use]
    pub fn recency(&self) -> DateTime<Utc> {
        self.returned_at.unwrap_or(self.loaned_at)
    }

    /// Non-empty classroom label, if any.
    #[must_use]
    pub fn classroom_label(&self) -> Option<&str> {
        self.classroom
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
    }

    /// Position cursor pointing at this row.
    #[must_use]
    pub fn cursor(&self) -> LoanCursor {
        LoanCursor {
            loaned_at: self.loaned_at,
            id: self.id.clone(),
        }
    }
}

/// Draft of a ledger row, before the store assigns an id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewLoan {
    /// Canonical item id resolved at write time
    pub item_ref: ItemId,
    /// Display name of the resolved item
    pub item_display_name: Option<String>,
    /// Email or classroom label
    pub borrower_key: String,
    /// Free-text destination
    pub destination: String,
    /// Free-text purpose
    pub purpose: String,
    /// Classroom label for batch loans
    pub classroom: Option<String>,
    /// When the item is due back
    pub expected_return_at: Option<DateTime<Utc>>,
    /// Free-text notes
    pub notes: Option<String>,
    /// When the loan started
    pub loaned_at: DateTime<Utc>,
}

impl NewLoan {
    /// Materialize into an active [`LoanEvent`] with the given id.
    #[must_use]
    pub fn into_event(self, id: LoanId, now: DateTime<Utc>) -> LoanEvent {
        LoanEvent {
            id,
            item_ref: self.item_ref.into_inner(),
            borrower_key: self.borrower_key,
            destination: self.destination,
            purpose: self.purpose,
            classroom: self.classroom,
            item_display_name: self.item_display_name,
            loaned_at: self.loaned_at,
            expected_return_at: self.expected_return_at,
            returned_at: None,
            returned_by: None,
            received_by: None,
            status: LoanStatus::Active,
            notes: self.notes,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Data written when a loan is closed.
#[derive(Clone, Debug, PartialEq)]
pub struct LoanClosure {
    /// Canonical id the row's `itemRef` is healed to
    pub canonical_ref: ItemId,
    /// When the item came back
    pub returned_at: DateTime<Utc>,
    /// Who brought it back
    pub returned_by: String,
    /// Operator who received it
    pub received_by: Option<String>,
    /// Return notes, appended to existing notes
    pub notes: Option<String>,
}

impl LoanClosure {
    /// Apply this closure to `event`, flipping it to `returned`.
    pub fn apply_to(&self, event: &mut LoanEvent) {
        event.status = LoanStatus::Returned;
        event.item_ref = self.canonical_ref.as_str().to_string();
        event.returned_at = Some(self.returned_at);
        event.returned_by = Some(self.returned_by.clone());
        event.received_by.clone_from(&self.received_by);
        if let Some(note) = self.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            event.notes = Some(match event.notes.take() {
                Some(existing) if !existing.trim().is_empty() => format!("{existing}\n{note}"),
                _ => note.to_string(),
            });
        }
        event.updated_at = self.returned_at;
    }
}

/// Position in the newest-first ledger order: `(loaned_at desc, id desc)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanCursor {
    /// Loan timestamp of the last row seen
    pub loaned_at: DateTime<Utc>,
    /// Id of the last row seen
    pub id: LoanId,
}

/// Filter, order and page over ledger rows.
///
/// Results are always newest-first by `loanedAt`, ties broken by id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoanQuery {
    /// Match rows whose `itemRef` is any of these (empty = any)
    pub item_refs: Vec<String>,
    /// Match rows in any of these statuses (empty = any)
    pub statuses: Vec<LoanStatus>,
    /// Match rows for this borrower
    pub borrower_key: Option<String>,
    /// Match rows for this classroom
    pub classroom: Option<String>,
    /// Maximum rows per page
    pub limit: Option<usize>,
    /// Resume strictly after this row
    pub after: Option<LoanCursor>,
}

impl LoanQuery {
    /// Query for all rows.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Query for open rows referencing any of `refs`.
    #[must_use]
    pub fn open_for<I, S>(refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::all()
            .with_item_refs(refs)
            .with_statuses(LoanStatus::OPEN)
    }

    /// Query for all open rows.
    #[must_use]
    pub fn open() -> Self {
        Self::all().with_statuses(LoanStatus::OPEN)
    }

    /// Restrict to rows referencing any of `refs`.
    #[must_use]
    pub fn with_item_refs<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.item_refs = refs.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given statuses.
    #[must_use]
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = LoanStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Restrict to one borrower.
    #[must_use]
    pub fn with_borrower(mut self, key: impl Into<String>) -> Self {
        self.borrower_key = Some(key.into());
        self
    }

    /// Restrict to one classroom.
    #[must_use]
    pub fn with_classroom(mut self, label: impl Into<String>) -> Self {
        self.classroom = Some(label.into());
        self
    }

    /// Limit page size.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resume after `cursor`.
    #[must_use]
    pub fn after(mut self, cursor: LoanCursor) -> Self {
        self.after = Some(cursor);
        self
    }

    /// Returns `true` if `event` passes every filter (ignores paging).
    #[must_use]
    pub fn matches(&self, event: &LoanEvent) -> bool {
        (self.item_refs.is_empty() || self.item_refs.iter().any(|r| *r == event.item_ref))
            && (self.statuses.is_empty() || self.statuses.contains(&event.status))
            && self
                .borrower_key
                .as_ref()
                .is_none_or(|key| *key == event.borrower_key)
            && self
                .classroom
                .as_ref()
                .is_none_or(|label| event.classroom.as_ref() == Some(label))
    }

    /// Newest-first comparison: `(loaned_at desc, id desc)`.
    #[must_use]
    pub fn newest_first(a: &LoanEvent, b: &LoanEvent) -> Ordering {
        b.loaned_at
            .cmp(&a.loaned_at)
            .then_with(|| b.id.cmp(&a.id))
    }

    /// Filter, order and page `events` the way a store must.
    ///
    /// Adapters that cannot push the query down use this directly.
    #[must_use]
    pub fn apply(&self, events: impl IntoIterator<Item = LoanEvent>) -> LoanPage {
        let mut matched: Vec<LoanEvent> = events.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(Self::newest_first);

        if let Some(cursor) = &self.after {
            matched.retain(|e| {
                (e.loaned_at, &e.id) < (cursor.loaned_at, &cursor.id)
            });
        }

        let next_cursor = match self.limit {
            Some(limit) if matched.len() > limit => {
                matched.truncate(limit);
                matched.last().map(LoanEvent::cursor)
            },
            _ => None,
        };

        LoanPage {
            loans: matched,
            next_cursor,
        }
    }
}

/// One page of ledger rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoanPage {
    /// Rows in newest-first order
    pub loans: Vec<LoanEvent>,
    /// Cursor for the next page; `None` on the last page
    pub next_cursor: Option<LoanCursor>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn event(id: &str, item: &str, minutes: i64, status: LoanStatus) -> LoanEvent {
        let mut e = NewLoan {
            item_ref: ItemId::new(item),
            item_display_name: None,
            borrower_key: "ana@school.edu".into(),
            destination: String::new(),
            purpose: String::new(),
            classroom: None,
            expected_return_at: None,
            notes: None,
            loaned_at: base() + Duration::minutes(minutes),
        }
        .into_event(LoanId::new(id), base());
        e.status = status;
        e
    }

    #[test]
    fn overdue_counts_as_open() {
        assert!(LoanStatus::Active.is_open());
        assert!(LoanStatus::Overdue.is_open());
        assert!(!LoanStatus::Returned.is_open());
    }

    #[test]
    fn closure_heals_item_ref_and_appends_notes() {
        let mut e = event("l1", "SEED-BRC-003", 0, LoanStatus::Active);
        e.notes = Some("charger included".into());
        LoanClosure {
            canonical_ref: ItemId::new("item-3"),
            returned_at: base() + Duration::hours(3),
            returned_by: "ana@school.edu".into(),
            received_by: Some("desk".into()),
            notes: Some("scratched lid".into()),
        }
        .apply_to(&mut e);

        assert_eq!(e.status, LoanStatus::Returned);
        assert_eq!(e.item_ref, "item-3");
        assert_eq!(e.notes.as_deref(), Some("charger included\nscratched lid"));
        assert_eq!(e.recency(), base() + Duration::hours(3));
    }

    #[test]
    fn query_filters_and_orders_newest_first() {
        let events = vec![
            event("a", "item-1", 0, LoanStatus::Returned),
            event("b", "item-1", 10, LoanStatus::Active),
            event("c", "item-2", 20, LoanStatus::Overdue),
        ];
        let page = LoanQuery::open().apply(events.clone());
        let ids: Vec<_> = page.loans.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);

        let page = LoanQuery::open_for(["item-1"]).apply(events);
        assert_eq!(page.loans.len(), 1);
        assert_eq!(page.loans[0].id.as_str(), "b");
    }

    #[test]
    fn paging_walks_all_rows_once() {
        let events: Vec<_> = (0..5)
            .map(|i| event(&format!("l{i}"), "item-1", i, LoanStatus::Returned))
            .collect();

        let mut query = LoanQuery::all().with_limit(2);
        let mut seen = Vec::new();
        loop {
            let page = query.apply(events.clone());
            seen.extend(page.loans.iter().map(|e| e.id.to_string()));
            match page.next_cursor {
                Some(cursor) => query = query.after(cursor),
                None => break,
            }
        }
        assert_eq!(seen, ["l4", "l3", "l2", "l1", "l0"]);
    }
}
