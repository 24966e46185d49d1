//! Integration tests for Store action broadcasting.
//!
//! Observers see every action the reducer processes, including the ones fed
//! back by effects. Scan-session callers rely on this to wait for outcomes.

#![allow(clippy::unwrap_used, clippy::panic)]

use equipment_ledger_core::effect::Effect;
use equipment_ledger_core::reducer::Reducer;
use equipment_ledger_core::{SmallVec, smallvec};
use equipment_ledger_runtime::Store;
use equipment_ledger_runtime::store::StoreError;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum DeskAction {
    /// Operator submits a checkout ticket
    Checkout { ticket: u64 },
    /// The item was verified
    Verified { ticket: u64 },
    /// The ledger row was written (terminal)
    Recorded { ticket: u64 },
    /// The ticket was refused (terminal)
    Refused { ticket: u64, reason: String },
    /// Return several tickets at once
    ReturnAll(Vec<u64>),
    /// One ticket came back
    Returned { ticket: u64 },
}

#[derive(Debug, Default)]
struct DeskState {
    recorded: Vec<u64>,
    returned: Vec<u64>,
}

struct DeskReducer;

impl Reducer for DeskReducer {
    type State = DeskState;
    type Action = DeskAction;
    type Environment = ();

    fn reduce(
        &self,
        state: &mut DeskState,
        action: DeskAction,
        _env: &(),
    ) -> SmallVec<[Effect<DeskAction>; 4]> {
        match action {
            DeskAction::Checkout { ticket } if ticket == 0 => {
                smallvec![Effect::Future(Box::pin(async move {
                    Some(DeskAction::Refused {
                        ticket,
                        reason: "blank ticket".into(),
                    })
                }))]
            },
            DeskAction::Checkout { ticket } => smallvec![Effect::Future(Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some(DeskAction::Verified { ticket })
            }))],
            DeskAction::Verified { ticket } => smallvec![Effect::Future(Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some(DeskAction::Recorded { ticket })
            }))],
            DeskAction::Recorded { ticket } => {
                state.recorded.push(ticket);
                smallvec![Effect::None]
            },
            DeskAction::ReturnAll(tickets) => smallvec![Effect::merge(
                tickets
                    .into_iter()
                    .map(|ticket| Effect::Future(Box::pin(async move {
                        Some(DeskAction::Returned { ticket })
                    })))
                    .collect()
            )],
            DeskAction::Returned { ticket } => {
                state.returned.push(ticket);
                smallvec![Effect::None]
            },
            DeskAction::Refused { .. } => smallvec![Effect::None],
        }
    }
}

fn desk() -> Store<DeskReducer> {
    Store::new(DeskState::default(), DeskReducer, ())
}

#[tokio::test]
async fn observers_see_the_whole_chain_in_order() {
    let store = desk();
    let mut rx = store.subscribe_actions();

    store.send(DeskAction::Checkout { ticket: 7 }).await.unwrap();
    store.settled().await;

    let mut seen = Vec::new();
    while let Ok(action) = rx.try_recv() {
        seen.push(action);
    }
    assert_eq!(
        seen,
        vec![
            DeskAction::Checkout { ticket: 7 },
            DeskAction::Verified { ticket: 7 },
            DeskAction::Recorded { ticket: 7 },
        ]
    );
    assert_eq!(store.state(|s| s.recorded.clone()).await, vec![7]);
}

#[tokio::test]
async fn wait_for_terminal_action_of_either_kind() {
    let store = desk();
    let terminal = |a: &DeskAction| {
        matches!(a, DeskAction::Recorded { .. } | DeskAction::Refused { .. })
    };

    let ok = store
        .send_and_wait_for(DeskAction::Checkout { ticket: 3 }, terminal, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(ok, DeskAction::Recorded { ticket: 3 });

    let refused = store
        .send_and_wait_for(DeskAction::Checkout { ticket: 0 }, terminal, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(matches!(refused, DeskAction::Refused { ticket: 0, .. }));
}

#[tokio::test]
async fn concurrent_waiters_each_get_their_own_result() {
    let store = desk();
    let waits = (1..=5).map(|ticket| {
        let store = store.clone();
        async move {
            store
                .send_and_wait_for(
                    DeskAction::Checkout { ticket },
                    move |a| *a == DeskAction::Recorded { ticket },
                    Duration::from_secs(1),
                )
                .await
        }
    });

    let results = futures::future::join_all(waits).await;
    for (ticket, result) in (1..=5).zip(results) {
        assert_eq!(result.unwrap(), DeskAction::Recorded { ticket });
    }
    let mut recorded = store.state(|s| s.recorded.clone()).await;
    recorded.sort_unstable();
    assert_eq!(recorded, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn waiting_for_an_action_that_never_comes_times_out() {
    let store = desk();
    let result = store
        .send_and_wait_for(
            DeskAction::Returned { ticket: 1 },
            |a| matches!(a, DeskAction::Recorded { .. }),
            Duration::from_millis(50),
        )
        .await;
    assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(50))));
}

#[tokio::test]
async fn parallel_effects_all_feed_back() {
    let store = desk();
    store.send(DeskAction::ReturnAll(vec![4, 5, 6])).await.unwrap();
    store.settled().await;

    let mut returned = store.state(|s| s.returned.clone()).await;
    returned.sort_unstable();
    assert_eq!(returned, vec![4, 5, 6]);
}

#[tokio::test]
async fn slow_observer_lags_without_blocking_the_store() {
    let store = Store::with_broadcast_capacity(DeskState::default(), DeskReducer, (), 2);
    let mut rx = store.subscribe_actions();

    for ticket in 1..=5 {
        store.send(DeskAction::Returned { ticket }).await.unwrap();
    }
    assert_eq!(store.state(|s| s.returned.len()).await, 5);
    assert!(matches!(
        rx.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Lagged(3))
    ));
    assert_eq!(rx.recv().await.unwrap(), DeskAction::Returned { ticket: 4 });
}

#[tokio::test]
async fn shutdown_refuses_waiters() {
    let store = desk();
    store.shutdown();
    assert!(store.is_shut_down());
    let result = store
        .send_and_wait_for(
            DeskAction::Checkout { ticket: 1 },
            |_| true,
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(result, Err(StoreError::ShutdownInProgress));
}
