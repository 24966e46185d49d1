//! Plain-text rendering for the console.

use chrono::{DateTime, Utc};
use equipment_ledger_core::item::Item;
use equipment_ledger_projections::{BorrowerGroup, TimelineEntry, TimelineLoan};
use equipment_ledger_runtime::{AuditReport, BatchMode, SessionOutcome, SyncStatus};
use std::fmt::Write;

fn at(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

fn sync(status: &SyncStatus) -> String {
    match status {
        SyncStatus::Synced => String::new(),
        SyncStatus::PendingSync { reason } => format!(" (inventory pending sync: {reason})"),
    }
}

/// One-line item summary.
#[must_use]
pub fn item(item: &Item) -> String {
    format!("{} [{}]", item.display_label(), item.status)
}

/// How a session ended, for the operator.
#[must_use]
pub fn outcome(outcome: &SessionOutcome) -> String {
    match outcome {
        SessionOutcome::Loaned(o) => format!(
            "Loaned {} to {}{}",
            o.item.display_label(),
            o.loan.borrower_key,
            sync(&o.sync)
        ),
        SessionOutcome::Returned(o) => {
            let mut line = format!("Returned {}{}", o.item.display_label(), sync(&o.sync));
            if let Some(anomaly) = &o.anomaly {
                let _ = write!(line, " [{anomaly:?}]");
            }
            line
        },
        SessionOutcome::Batch(o) => {
            let verb = match o.mode {
                BatchMode::Loan => "lent to",
                BatchMode::Return => "returned from",
            };
            let mut line = format!(
                "{} item(s) {verb} {}{}",
                o.succeeded.len(),
                o.classroom,
                sync(&o.sync)
            );
            for failure in &o.failed {
                let _ = write!(line, "\n  ! {}: {:?}", failure.reference, failure.reason);
            }
            line
        },
        SessionOutcome::Rejected(e) => format!("Rejected: {e}"),
        SessionOutcome::Cancelled => "Cancelled".to_string(),
        SessionOutcome::TimedOut => "Session timed out".to_string(),
        SessionOutcome::SourceFailed(reason) => format!("Scanner failed: {reason}"),
    }
}

fn loan_line(out: &mut String, indent: &str, loan: &TimelineLoan) {
    let state = if loan.event.is_open() {
        loan.event.status.to_string()
    } else {
        format!("returned {}", loan.event.returned_at.map(at).unwrap_or_default())
    };
    let _ = writeln!(
        out,
        "{indent}{}  {}  {}  ({state})",
        at(loan.event.loaned_at),
        loan.item_label,
        loan.event.borrower_key
    );
}

/// The recent-activity timeline.
#[must_use]
pub fn timeline(entries: &[TimelineEntry]) -> String {
    if entries.is_empty() {
        return "No activity yet\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        match entry {
            TimelineEntry::Classroom(group) => {
                let _ = writeln!(
                    out,
                    "Classroom {}: {} item(s), {} out",
                    group.label,
                    group.members.len(),
                    group.open_count()
                );
                for member in &group.members {
                    loan_line(&mut out, "    ", member);
                }
            },
            TimelineEntry::Individual(loan) => loan_line(&mut out, "", loan),
        }
    }
    out
}

/// Loans grouped by borrower.
#[must_use]
pub fn borrowers(groups: &[BorrowerGroup]) -> String {
    let mut out = String::new();
    for group in groups {
        let _ = writeln!(
            out,
            "{}: {} loan(s), {} open",
            group.borrower_key,
            group.loans.len(),
            group.open_count()
        );
        for loan in &group.loans {
            loan_line(&mut out, "    ", loan);
        }
    }
    out
}

/// Audit summary with one line per mismatch.
#[must_use]
pub fn audit(report: &AuditReport) -> String {
    let mut out = format!(
        "Checked {} item(s) and {} open loan(s): ",
        report.items, report.open_loans
    );
    if report.is_clean() {
        out.push_str("clean\n");
        return out;
    }
    let _ = writeln!(out, "{} mismatch(es)", report.mismatches.len());
    for mismatch in &report.mismatches {
        let _ = writeln!(out, "  {}: {mismatch:?}", mismatch.kind());
    }
    out
}
