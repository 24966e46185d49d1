//! Ledger/projection agreement checks.

use equipment_ledger_core::item::{Item, ItemStatus};
use equipment_ledger_core::loan::LoanEvent;

/// Describe every way `items` disagree with the open rows in `loans`.
///
/// An item counts as out when an open row references it under any of its
/// reference strings. Maintenance and damaged items are only checked for
/// the holder rule.
#[must_use]
pub fn projection_violations(items: &[Item], loans: &[LoanEvent]) -> Vec<String> {
    let mut violations = Vec::new();

    for item in items {
        if !item.is_consistent() {
            violations.push(format!(
                "{}: status {} with holder {:?}",
                item.id, item.status, item.current_holder
            ));
        }

        let refs = item.reference_strings();
        let open = loans
            .iter()
            .filter(|l| l.is_open() && refs.iter().any(|r| *r == l.item_ref))
            .count();

        match (item.status, open) {
            (ItemStatus::Loaned, 0) => violations.push(format!("{}: loaned without an open row", item.id)),
            (ItemStatus::Available, n) if n > 0 => {
                violations.push(format!("{}: available with {n} open row(s)", item.id));
            },
            (_, n) if n > 1 => violations.push(format!("{}: {n} open rows", item.id)),
            _ => {},
        }
    }

    violations
}

/// Assert `status = loaned ⟺ an open row exists` for every item.
///
/// # Panics
///
/// Panics listing every violation.
#[allow(clippy::panic)] // Test assertion
pub fn assert_projection_consistent(items: &[Item], loans: &[LoanEvent]) {
    let violations = projection_violations(items, loans);
    assert!(
        violations.is_empty(),
        "ledger and projection disagree:\n  {}",
        violations.join("\n  ")
    );
}
