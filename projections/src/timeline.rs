//! Operator-facing timeline over ledger rows.
//!
//! Classroom groups and individual loans are interleaved by their most
//! recent timestamp. A row belongs to a classroom group when it carries a
//! classroom label, or when its destination or purpose reads like one (see
//! [`ClassroomHeuristic`]). Members of a group keep their own recency order.
//!
//! Composition is pure: nothing here touches the ledger or the projection.

use chrono::{DateTime, Utc};
use equipment_ledger_core::catalog::CatalogIndex;
use equipment_ledger_core::loan::LoanEvent;
use equipment_ledger_core::normalize::normalize_text;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Words that mark free text as a classroom, compared after normalization.
pub const CLASSROOM_KEYWORDS: [&str; 8] = [
    "aula",
    "salon",
    "classroom",
    "class",
    "room",
    "grado",
    "grupo",
    "curso",
];

/// Display metadata for item references.
pub trait ItemDirectory {
    /// Operator-facing name of the item `item_ref` points at, if known.
    fn display_name(&self, item_ref: &str) -> Option<String>;
}

/// A directory that knows nothing; every row falls back to raw identifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDirectory;

impl ItemDirectory for NoDirectory {
    fn display_name(&self, _item_ref: &str) -> Option<String> {
        None
    }
}

impl ItemDirectory for CatalogIndex {
    fn display_name(&self, item_ref: &str) -> Option<String> {
        let item_ref = item_ref.trim();
        if let Some(found) = self.lookup(item_ref) {
            return Some(found.item.display_name.clone());
        }
        self.items()
            .iter()
            .find(|item| item.aliases.iter().any(|alias| alias.trim() == item_ref))
            .map(|item| item.display_name.clone())
    }
}

impl<S: std::hash::BuildHasher> ItemDirectory for HashMap<String, String, S> {
    fn display_name(&self, item_ref: &str) -> Option<String> {
        self.get(item_ref.trim()).cloned()
    }
}

/// Decides which classroom group, if any, a row belongs to.
pub trait ClassroomPredicate {
    /// The group label for `event`, or `None` for an individual loan.
    fn classroom_of(&self, event: &LoanEvent) -> Option<String>;
}

/// Explicit classroom label first, then keyword match on destination and
/// purpose.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassroomHeuristic;

impl ClassroomHeuristic {
    /// Returns `true` when `text` contains a classroom keyword as a word.
    #[must_use]
    pub fn looks_like_classroom(text: &str) -> bool {
        normalize_text(text)
            .split(' ')
            .any(|word| CLASSROOM_KEYWORDS.contains(&word))
    }
}

impl ClassroomPredicate for ClassroomHeuristic {
    fn classroom_of(&self, event: &LoanEvent) -> Option<String> {
        if let Some(label) = event.classroom_label() {
            return Some(label.to_string());
        }
        [event.destination.trim(), event.purpose.trim()]
            .into_iter()
            .find(|text| Self::looks_like_classroom(text))
            .map(str::to_string)
    }
}

/// Only rows with an explicit classroom label are grouped.
#[derive(Clone, Copy, Debug, Default)]
pub struct LabelOnly;

impl ClassroomPredicate for LabelOnly {
    fn classroom_of(&self, event: &LoanEvent) -> Option<String> {
        event.classroom_label().map(str::to_string)
    }
}

/// One ledger row as shown on the timeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimelineLoan {
    /// The row
    pub event: LoanEvent,
    /// Directory name, else the backfilled name, else the raw reference
    pub item_label: String,
    /// Recency timestamp
    pub at: DateTime<Utc>,
}

impl TimelineLoan {
    fn new(event: LoanEvent, directory: &dyn ItemDirectory) -> Self {
        let item_label = directory
            .display_name(&event.item_ref)
            .or_else(|| event.item_display_name.clone())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| event.item_ref.clone());
        Self {
            at: event.recency(),
            event,
            item_label,
        }
    }
}

/// Rows sharing one classroom.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassroomGroup {
    /// Label of the group's most recent row
    pub label: String,
    /// Most recent member timestamp
    pub latest_at: DateTime<Utc>,
    /// Members, newest first
    pub members: Vec<TimelineLoan>,
}

impl ClassroomGroup {
    /// Members still out.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.members.iter().filter(|m| m.event.is_open()).count()
    }
}

/// An entry on the composed timeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    /// A classroom and its rows
    Classroom(ClassroomGroup),
    /// A single loan
    Individual(TimelineLoan),
}

impl TimelineEntry {
    /// Timestamp the entry is ordered by.
    #[must_use]
    pub fn latest_at(&self) -> DateTime<Utc> {
        match self {
            Self::Classroom(group) => group.latest_at,
            Self::Individual(loan) => loan.at,
        }
    }

    fn tie_key(&self) -> &str {
        match self {
            Self::Classroom(group) => &group.label,
            Self::Individual(loan) => loan.event.id.as_str(),
        }
    }
}

fn newest_first(a: &TimelineLoan, b: &TimelineLoan) -> Ordering {
    b.at.cmp(&a.at).then_with(|| b.event.id.cmp(&a.event.id))
}

/// Compose the timeline for `events`.
///
/// Classroom labels are grouped case-, accent- and whitespace-insensitively.
#[must_use]
pub fn compose(
    events: &[LoanEvent],
    directory: &dyn ItemDirectory,
    predicate: &dyn ClassroomPredicate,
) -> Vec<TimelineEntry> {
    let mut groups: HashMap<String, Vec<TimelineLoan>> = HashMap::new();
    let mut entries = Vec::new();

    for event in events {
        let loan = TimelineLoan::new(event.clone(), directory);
        match predicate.classroom_of(event) {
            Some(label) => groups.entry(normalize_text(&label)).or_default().push(loan),
            None => entries.push(TimelineEntry::Individual(loan)),
        }
    }

    for (_, mut members) in groups {
        members.sort_by(newest_first);
        let Some(newest) = members.first() else {
            continue;
        };
        let label = predicate.classroom_of(&newest.event).unwrap_or_default();
        let latest_at = newest.at;
        entries.push(TimelineEntry::Classroom(ClassroomGroup {
            label,
            latest_at,
            members,
        }));
    }

    entries.sort_by(|a, b| {
        b.latest_at()
            .cmp(&a.latest_at())
            .then_with(|| a.tie_key().cmp(b.tie_key()))
    });
    entries
}

/// All rows of one borrower.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BorrowerGroup {
    /// Borrower key as written on the most recent row
    pub borrower_key: String,
    /// Most recent row timestamp
    pub latest_at: DateTime<Utc>,
    /// Rows, newest first
    pub loans: Vec<TimelineLoan>,
}

impl BorrowerGroup {
    /// Rows still out.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.loans.iter().filter(|l| l.event.is_open()).count()
    }
}

/// Group rows by borrower (trimmed, case-insensitive), most recent first.
#[must_use]
pub fn group_by_borrower(events: &[LoanEvent], directory: &dyn ItemDirectory) -> Vec<BorrowerGroup> {
    let mut by_key: HashMap<String, Vec<TimelineLoan>> = HashMap::new();
    for event in events {
        by_key
            .entry(event.borrower_key.trim().to_lowercase())
            .or_default()
            .push(TimelineLoan::new(event.clone(), directory));
    }

    let mut groups: Vec<BorrowerGroup> = by_key
        .into_values()
        .filter_map(|mut loans| {
            loans.sort_by(newest_first);
            let newest = loans.first()?;
            let borrower_key = newest.event.borrower_key.trim().to_string();
            let latest_at = newest.at;
            Some(BorrowerGroup {
                borrower_key,
                latest_at,
                loans,
            })
        })
        .collect();
    groups.sort_by(|a, b| {
        b.latest_at
            .cmp(&a.latest_at)
            .then_with(|| a.borrower_key.cmp(&b.borrower_key))
    });
    groups
}
