//! Property tests for timeline composition.

#![allow(clippy::unwrap_used)]

use chrono::Duration;
use equipment_ledger_core::loan::{LoanEvent, LoanId, LoanStatus};
use equipment_ledger_core::normalize::normalize_text;
use equipment_ledger_projections::{LabelOnly, NoDirectory, TimelineEntry, compose};
use equipment_ledger_testing::{base_time, fixtures};
use proptest::prelude::*;
use std::collections::HashSet;

const LABELS: [&str; 5] = ["", "201", "Aula 3", " aula 3 ", "Salón B"];

fn event((index, minutes, label, returned_after): (usize, i64, usize, Option<i64>)) -> LoanEvent {
    let loaned_at = base_time() + Duration::minutes(minutes);
    let mut draft = fixtures::loan_draft(&format!("item-{index}"), "ana@school.edu", loaned_at);
    draft.classroom = Some(LABELS[label].to_string());
    let mut event = draft.into_event(LoanId::new(format!("loan-{index:03}")), loaned_at);
    if let Some(after) = returned_after {
        event.status = LoanStatus::Returned;
        event.returned_at = Some(loaned_at + Duration::minutes(after));
    }
    event
}

fn events() -> impl Strategy<Value = Vec<LoanEvent>> {
    prop::collection::vec(
        (0..500i64, 0..LABELS.len(), prop::option::of(1..300i64)),
        0..24,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (minutes, label, returned))| event((i, minutes, label, returned)))
            .collect()
    })
}

proptest! {
    #[test]
    fn every_row_appears_exactly_once(events in events()) {
        let timeline = compose(&events, &NoDirectory, &LabelOnly);
        let mut ids = Vec::new();
        for entry in &timeline {
            match entry {
                TimelineEntry::Classroom(group) => {
                    ids.extend(group.members.iter().map(|m| m.event.id.clone()));
                },
                TimelineEntry::Individual(loan) => ids.push(loan.event.id.clone()),
            }
        }
        ids.sort();
        let mut expected: Vec<_> = events.iter().map(|e| e.id.clone()).collect();
        expected.sort();
        prop_assert_eq!(ids, expected);
    }

    #[test]
    fn entries_and_members_are_newest_first(events in events()) {
        let timeline = compose(&events, &NoDirectory, &LabelOnly);
        for pair in timeline.windows(2) {
            prop_assert!(pair[0].latest_at() >= pair[1].latest_at());
        }
        for entry in &timeline {
            if let TimelineEntry::Classroom(group) = entry {
                prop_assert_eq!(group.latest_at, group.members[0].at);
                for pair in group.members.windows(2) {
                    prop_assert!(pair[0].at >= pair[1].at);
                }
            }
        }
    }

    #[test]
    fn one_group_per_normalized_label(events in events()) {
        let timeline = compose(&events, &NoDirectory, &LabelOnly);
        let mut labels = HashSet::new();
        for entry in &timeline {
            match entry {
                TimelineEntry::Classroom(group) => {
                    prop_assert!(labels.insert(normalize_text(&group.label)));
                },
                TimelineEntry::Individual(loan) => {
                    prop_assert!(loan.event.classroom_label().is_none());
                },
            }
        }
    }
}
