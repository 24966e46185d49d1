//! Scan session controller driven through a channel scan source.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::{Harness, config};
use equipment_ledger_core::item::ItemStatus;
use equipment_ledger_runtime::{
    BatchMode, ConfirmDetails, Phase, ScanAction, ScanEnvironment, ScanSessionController,
    SessionMode, SessionOutcome,
};
use equipment_ledger_testing::{ChannelScanSource, fixtures};
use std::sync::Arc;
use std::time::Duration;

fn controller(h: &Harness, source: &Arc<ChannelScanSource>, mode: SessionMode) -> ScanSessionController {
    let environment = ScanEnvironment::new(h.reconciler.clone(), &config());
    ScanSessionController::new(source.clone(), environment, mode)
}

async fn settle(controller: &ScanSessionController) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    controller.store().settled().await;
}

fn loan_form(borrower: &str) -> ConfirmDetails {
    ConfirmDetails::Loan {
        borrower_key: borrower.into(),
        destination: "Aula 4".into(),
        purpose: String::new(),
        notes: None,
        expected_return_at: None,
    }
}

#[tokio::test]
async fn scanned_loan_is_confirmed_through_reconciler() {
    let h = Harness::new();
    let items = h.seed(vec![fixtures::projector()]).await;
    let source = Arc::new(ChannelScanSource::new());
    let controller = controller(&h, &source, SessionMode::SingleLoan);
    controller.start().await.unwrap();

    assert!(source.scan("QR-0001"));
    settle(&controller).await;
    let state = controller.store().state(Clone::clone).await;
    assert_eq!(state.phase, Phase::Accumulating);
    assert_eq!(state.refs, vec!["QR-0001".to_string()]);
    assert_eq!(state.resolved.get("QR-0001").map(|i| i.id.clone()), Some(items[0].id.clone()));

    let finished = controller
        .store()
        .send_and_wait_for(
            ScanAction::Confirm(loan_form("ana@school.edu")),
            |a| matches!(a, ScanAction::Finished { .. }),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let ScanAction::Finished {
        outcome: SessionOutcome::Loaned(outcome),
        ..
    } = finished
    else {
        panic!("expected a loan outcome, got {finished:?}");
    };
    assert_eq!(outcome.item.status, ItemStatus::Loaned);
    assert_eq!(controller.store().state(|s| s.phase).await, Phase::Idle);
    h.assert_consistent();

    controller.stop().await;
    assert!(!source.is_held());
}

#[tokio::test]
async fn rejected_confirmation_keeps_session_open() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let source = Arc::new(ChannelScanSource::new());
    let controller = controller(&h, &source, SessionMode::SingleLoan);
    controller.start().await.unwrap();
    source.scan("QR-0001");
    settle(&controller).await;

    controller
        .store()
        .send_and_wait_for(
            ScanAction::Confirm(loan_form("")),
            |a| matches!(a, ScanAction::Finished { .. }),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    let state = controller.store().state(Clone::clone).await;
    assert_eq!(state.phase, Phase::Accumulating);
    assert!(state.last_error.is_some());
    assert!(h.store.loans().is_empty());
}

#[tokio::test]
async fn classroom_batch_accumulates_unique_scans() {
    let h = Harness::new();
    h.seed((1..=3).map(fixtures::tablet).collect()).await;
    let source = Arc::new(ChannelScanSource::new());
    let controller = controller(&h, &source, SessionMode::ClassroomBatch);
    controller.start().await.unwrap();

    for code in ["QR-1001", "QR-1001", "QR-1002", "QR-1001", "QR-1003", "QR-1003"] {
        source.scan(code);
    }
    settle(&controller).await;
    assert_eq!(controller.store().state(|s| s.refs.len()).await, 3);

    let finished = controller
        .store()
        .send_and_wait_for(
            ScanAction::Confirm(ConfirmDetails::Classroom {
                classroom_label: "301".into(),
                direction: BatchMode::Loan,
                purpose: "Lectura".into(),
                notes: None,
            }),
            |a| matches!(a, ScanAction::Finished { .. }),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    let ScanAction::Finished {
        outcome: SessionOutcome::Batch(batch),
        ..
    } = finished
    else {
        panic!("expected a batch outcome, got {finished:?}");
    };
    assert_eq!(batch.succeeded.len(), 3);
    assert!(batch.failed.is_empty());
    h.assert_consistent();
}

#[tokio::test(start_paused = true)]
async fn cancel_debounces_same_code_but_not_a_different_one() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector(), fixtures::speaker()]).await;
    let source = Arc::new(ChannelScanSource::new());
    let controller = controller(&h, &source, SessionMode::SingleReturn);
    controller.start().await.unwrap();

    source.scan("QR-0001");
    settle(&controller).await;
    controller.store().send(ScanAction::Cancel).await.unwrap();

    source.scan("QR-0001");
    settle(&controller).await;
    assert_eq!(controller.store().state(|s| s.phase).await, Phase::Idle);

    source.scan("QR-0002");
    settle(&controller).await;
    let state = controller.store().state(Clone::clone).await;
    assert_eq!(state.phase, Phase::Accumulating);
    assert_eq!(state.refs, vec!["QR-0002".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn same_code_reopens_after_cooldown() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let source = Arc::new(ChannelScanSource::new());
    let controller = controller(&h, &source, SessionMode::SingleLoan);
    controller.start().await.unwrap();

    source.scan("QR-0001");
    settle(&controller).await;
    controller.store().send(ScanAction::Cancel).await.unwrap();

    tokio::time::sleep(config().scan_cooldown + Duration::from_millis(10)).await;
    source.scan("QR-0001");
    settle(&controller).await;
    assert_eq!(controller.store().state(|s| s.phase).await, Phase::Accumulating);
}

#[tokio::test(start_paused = true)]
async fn idle_session_times_out() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let source = Arc::new(ChannelScanSource::new());
    let controller = controller(&h, &source, SessionMode::SingleLoan);
    controller.start().await.unwrap();

    source.scan("QR-0001");
    settle(&controller).await;
    tokio::time::sleep(config().session_timeout + Duration::from_secs(1)).await;
    settle(&controller).await;

    let state = controller.store().state(Clone::clone).await;
    assert_eq!(state.phase, Phase::Idle);
    assert_eq!(state.last_outcome, Some(SessionOutcome::TimedOut));
}

#[tokio::test]
async fn hardware_error_closes_session_and_releases_source() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let source = Arc::new(ChannelScanSource::new());
    let controller = controller(&h, &source, SessionMode::ClassroomBatch);
    controller.start().await.unwrap();

    source.scan("QR-0001");
    source.fail("lens covered");
    settle(&controller).await;
    for _ in 0..10 {
        if !source.is_held() {
            break;
        }
        tokio::task::yield_now().await;
    }

    let state = controller.store().state(Clone::clone).await;
    assert!(!state.is_open());
    assert!(matches!(state.last_outcome, Some(SessionOutcome::SourceFailed(_))));
    assert!(!source.is_held());
    assert_eq!(source.release_count(), 1);
    assert!(!controller.is_running());
}

#[tokio::test]
async fn refused_device_reports_source_failure() {
    let h = Harness::new();
    let source = Arc::new(ChannelScanSource::new());
    source.set_refuse_open(true);
    let controller = controller(&h, &source, SessionMode::SingleLoan);

    assert!(controller.start().await.is_err());
    assert!(matches!(
        controller.store().state(|s| s.last_outcome.clone()).await,
        Some(SessionOutcome::SourceFailed(_))
    ));
    assert_eq!(source.open_count(), 0);
}

#[tokio::test]
async fn dropping_controller_releases_source() {
    let h = Harness::new();
    let source = Arc::new(ChannelScanSource::new());
    {
        let controller = controller(&h, &source, SessionMode::SingleLoan);
        controller.start().await.unwrap();
        assert!(source.is_held());
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!source.is_held());
    assert_eq!(source.release_count(), 1);
}
