//! Scan session: accumulate scanned references for one operator action.
//!
//! `Idle → Accumulating → Finalizing → Idle`. The [`ScanSessionReducer`] is
//! pure; finalization and display lookups are effects delegated to a
//! [`SessionDispatcher`] (the [`Reconciler`](crate::reconciler::Reconciler)
//! in production). Timers carry the session generation or a cooldown token,
//! so a timer from an earlier session never affects the current one.
//!
//! [`ScanSessionController`] pumps a [`ScanSource`] into a [`Store`] and
//! holds the device through a [`ScanLease`] that releases it on every exit
//! path.

use crate::config::LedgerConfig;
use crate::reconciler::{BatchMode, BatchOutcome, LoanOutcome, ReconcileError, ReturnOutcome};
use crate::store::Store;
use chrono::{DateTime, Utc};
use equipment_ledger_core::effect::Effect;
use equipment_ledger_core::item::Item;
use equipment_ledger_core::reducer::Reducer;
use equipment_ledger_core::scan::{ScanError, ScanSource};
use equipment_ledger_core::{SmallVec, smallvec};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// What the session is collecting references for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionMode {
    /// One item out
    #[default]
    SingleLoan,
    /// One item back
    SingleReturn,
    /// Many items to or from a classroom
    ClassroomBatch,
}

impl SessionMode {
    /// Returns `true` for modes that hold exactly one reference.
    #[must_use]
    pub const fn is_single(self) -> bool {
        !matches!(self, Self::ClassroomBatch)
    }
}

/// Session lifecycle phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// No session open
    #[default]
    Idle,
    /// Collecting scans
    Accumulating,
    /// Handed to the dispatcher, waiting for the outcome
    Finalizing,
}

/// The operator's form, submitted on confirmation.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfirmDetails {
    /// Single loan form
    Loan {
        /// Borrower key
        borrower_key: String,
        /// Destination
        destination: String,
        /// Purpose
        purpose: String,
        /// Notes
        notes: Option<String>,
        /// Due time
        expected_return_at: Option<DateTime<Utc>>,
    },
    /// Single return form
    Return {
        /// Who brought it back
        returned_by: String,
        /// Receiving operator
        received_by: Option<String>,
        /// Condition notes
        notes: Option<String>,
    },
    /// Classroom batch form
    Classroom {
        /// Classroom label
        classroom_label: String,
        /// Loan or return
        direction: BatchMode,
        /// Purpose
        purpose: String,
        /// Notes
        notes: Option<String>,
    },
}

impl ConfirmDetails {
    /// Whether this form belongs to `mode`.
    #[must_use]
    pub const fn fits(&self, mode: SessionMode) -> bool {
        matches!(
            (self, mode),
            (Self::Loan { .. }, SessionMode::SingleLoan)
                | (Self::Return { .. }, SessionMode::SingleReturn)
                | (Self::Classroom { .. }, SessionMode::ClassroomBatch)
        )
    }
}

/// Everything the dispatcher needs to finalize a session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRequest {
    /// Session mode
    pub mode: SessionMode,
    /// Accumulated references, verbatim, in scan order
    pub refs: Vec<String>,
    /// The operator's form
    pub details: ConfirmDetails,
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    /// Single loan recorded
    Loaned(Box<LoanOutcome>),
    /// Single return recorded
    Returned(Box<ReturnOutcome>),
    /// Classroom batch processed
    Batch(Box<BatchOutcome>),
    /// The reconciler refused the operation
    Rejected(ReconcileError),
    /// Cancelled by the operator
    Cancelled,
    /// Hard timeout elapsed
    TimedOut,
    /// The scan hardware failed
    SourceFailed(String),
}

/// Finalizes sessions and looks items up for display.
pub trait SessionDispatcher: Send + Sync {
    /// Best-effort lookup for operator feedback. `None` never blocks
    /// accumulation.
    fn lookup(&self, reference: String) -> BoxFuture<'_, Option<Item>>;

    /// Finalize a confirmed session.
    fn dispatch(&self, request: SessionRequest) -> BoxFuture<'_, SessionOutcome>;
}

/// Actions processed by [`ScanSessionReducer`].
#[derive(Clone, Debug, PartialEq)]
pub enum ScanAction {
    /// Switch mode (Idle only)
    SetMode(SessionMode),
    /// Open a session explicitly
    Start,
    /// A decoded scan payload
    Scanned(String),
    /// Display lookup result
    ResolvedForDisplay {
        /// Session the lookup belongs to
        generation: u64,
        /// Raw reference looked up
        reference: String,
        /// The item, if found
        item: Option<Item>,
    },
    /// Operator confirmed with their form
    Confirm(ConfirmDetails),
    /// Operator cancelled
    Cancel,
    /// Dispatcher finished
    Finished {
        /// Session that was finalized
        generation: u64,
        /// Result
        outcome: SessionOutcome,
    },
    /// Hard timeout timer fired
    TimedOut {
        /// Session the timer belongs to
        generation: u64,
    },
    /// Cooldown timer fired
    CooldownElapsed {
        /// Cooldown the timer belongs to
        token: u64,
    },
    /// The scan source errored or ended
    SourceFailed(String),
}

/// A reference being ignored after a cancellation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cooldown {
    /// The debounced reference
    pub reference: String,
    /// Matches the pending [`ScanAction::CooldownElapsed`]
    pub token: u64,
}

/// Scan session state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanSessionState {
    /// Current mode
    pub mode: SessionMode,
    /// Current phase
    pub phase: Phase,
    /// Incremented every time a session opens
    pub generation: u64,
    /// Accumulated references (ordered, unique)
    pub refs: Vec<String>,
    /// Display lookups that succeeded
    pub resolved: HashMap<String, Item>,
    /// Active debounce, if any
    pub cooldown: Option<Cooldown>,
    /// Most recently accepted payload
    pub last_scanned: Option<String>,
    /// Outcome of the last session
    pub last_outcome: Option<SessionOutcome>,
    /// Last operator-facing error
    pub last_error: Option<String>,
    cooldown_seq: u64,
}

impl ScanSessionState {
    /// Idle state in `mode`.
    #[must_use]
    pub fn new(mode: SessionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Returns `true` if a session is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase != Phase::Idle
    }

    fn open(&mut self) {
        self.generation += 1;
        self.phase = Phase::Accumulating;
        self.refs.clear();
        self.resolved.clear();
        self.last_error = None;
    }

    fn close(&mut self) {
        self.phase = Phase::Idle;
        self.refs.clear();
        self.resolved.clear();
    }
}

/// Injected collaborators and timings.
#[derive(Clone)]
pub struct ScanEnvironment {
    /// Finalizes sessions
    pub dispatcher: Arc<dyn SessionDispatcher>,
    /// Hard timeout of an open session
    pub session_timeout: Duration,
    /// Debounce window after a cancellation
    pub cooldown: Duration,
}

impl ScanEnvironment {
    /// Environment with timings from `config`.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn SessionDispatcher>, config: &LedgerConfig) -> Self {
        Self {
            dispatcher,
            session_timeout: config.session_timeout,
            cooldown: config.scan_cooldown,
        }
    }
}

/// Pure scan session state machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanSessionReducer;

type Effects = SmallVec<[Effect<ScanAction>; 4]>;

impl ScanSessionReducer {
    fn open(state: &mut ScanSessionState, env: &ScanEnvironment) -> Effect<ScanAction> {
        state.open();
        tracing::debug!(generation = state.generation, mode = ?state.mode, "Scan session opened");
        Effect::delay(
            env.session_timeout,
            ScanAction::TimedOut {
                generation: state.generation,
            },
        )
    }

    fn lookup(state: &ScanSessionState, env: &ScanEnvironment, reference: String) -> Effect<ScanAction> {
        let dispatcher = Arc::clone(&env.dispatcher);
        let generation = state.generation;
        Effect::Future(Box::pin(async move {
            let item = dispatcher.lookup(reference.clone()).await;
            Some(ScanAction::ResolvedForDisplay {
                generation,
                reference,
                item,
            })
        }))
    }

    fn scanned(state: &mut ScanSessionState, payload: String, env: &ScanEnvironment) -> Effects {
        let payload = payload.trim().to_string();
        if payload.is_empty() {
            return smallvec![Effect::None];
        }

        match &state.cooldown {
            Some(cooldown) if cooldown.reference == payload => {
                tracing::trace!(payload, "Ignoring scan during cooldown");
                return smallvec![Effect::None];
            },
            Some(_) => state.cooldown = None,
            None => {},
        }

        let mut effects: Effects = SmallVec::new();
        match state.phase {
            Phase::Finalizing => return smallvec![Effect::None],
            Phase::Idle => effects.push(Self::open(state, env)),
            Phase::Accumulating => {},
        }

        if state.refs.iter().any(|r| *r == payload) {
            return smallvec![Effect::None];
        }
        if state.mode.is_single() {
            state.refs.clear();
            state.resolved.clear();
        }
        state.refs.push(payload.clone());
        state.last_scanned = Some(payload.clone());
        effects.push(Self::lookup(state, env, payload));
        effects
    }

    fn confirm(state: &mut ScanSessionState, details: ConfirmDetails, env: &ScanEnvironment) -> Effects {
        if state.phase != Phase::Accumulating {
            state.last_error = Some("no open scan session".to_string());
            return smallvec![Effect::None];
        }
        if state.refs.is_empty() {
            state.last_error = Some("nothing scanned yet".to_string());
            return smallvec![Effect::None];
        }
        if !details.fits(state.mode) {
            state.last_error = Some(format!("form does not match {:?} mode", state.mode));
            return smallvec![Effect::None];
        }

        state.phase = Phase::Finalizing;
        state.last_error = None;
        let request = SessionRequest {
            mode: state.mode,
            refs: state.refs.clone(),
            details,
        };
        let dispatcher = Arc::clone(&env.dispatcher);
        let generation = state.generation;
        smallvec![Effect::Future(Box::pin(async move {
            let outcome = dispatcher.dispatch(request).await;
            Some(ScanAction::Finished { generation, outcome })
        }))]
    }

    fn cancel(state: &mut ScanSessionState, env: &ScanEnvironment) -> Effects {
        if state.is_open() {
            state.last_outcome = Some(SessionOutcome::Cancelled);
        }
        state.close();

        let Some(reference) = state.last_scanned.clone() else {
            return smallvec![Effect::None];
        };
        state.cooldown_seq += 1;
        let token = state.cooldown_seq;
        state.cooldown = Some(Cooldown { reference, token });
        smallvec![Effect::delay(env.cooldown, ScanAction::CooldownElapsed { token })]
    }
}

impl Reducer for ScanSessionReducer {
    type State = ScanSessionState;
    type Action = ScanAction;
    type Environment = ScanEnvironment;

    fn reduce(&self, state: &mut ScanSessionState, action: ScanAction, env: &ScanEnvironment) -> Effects {
        match action {
            ScanAction::SetMode(mode) => {
                if state.is_open() {
                    state.last_error = Some("cannot switch mode during a session".to_string());
                } else {
                    state.mode = mode;
                }
                smallvec![Effect::None]
            },
            ScanAction::Start => {
                if state.is_open() {
                    return smallvec![Effect::None];
                }
                smallvec![Self::open(state, env)]
            },
            ScanAction::Scanned(payload) => Self::scanned(state, payload, env),
            ScanAction::ResolvedForDisplay {
                generation,
                reference,
                item,
            } => {
                if generation == state.generation && state.refs.contains(&reference) {
                    if let Some(item) = item {
                        state.resolved.insert(reference, item);
                    }
                }
                smallvec![Effect::None]
            },
            ScanAction::Confirm(details) => Self::confirm(state, details, env),
            ScanAction::Cancel => Self::cancel(state, env),
            ScanAction::Finished { generation, outcome } => {
                if generation != state.generation {
                    tracing::debug!(generation, current = state.generation, "Ignoring stale session outcome");
                    return smallvec![Effect::None];
                }
                if state.phase == Phase::Finalizing {
                    if let SessionOutcome::Rejected(error) = &outcome {
                        state.phase = Phase::Accumulating;
                        state.last_error = Some(error.to_string());
                    } else {
                        state.close();
                    }
                }
                state.last_outcome = Some(outcome);
                smallvec![Effect::None]
            },
            ScanAction::TimedOut { generation } => {
                if generation == state.generation && state.is_open() {
                    tracing::info!(generation, refs = state.refs.len(), "Scan session timed out");
                    state.close();
                    state.last_outcome = Some(SessionOutcome::TimedOut);
                }
                smallvec![Effect::None]
            },
            ScanAction::CooldownElapsed { token } => {
                if state.cooldown.as_ref().is_some_and(|c| c.token == token) {
                    state.cooldown = None;
                }
                smallvec![Effect::None]
            },
            ScanAction::SourceFailed(reason) => {
                tracing::warn!(%reason, open = state.is_open(), "Scan source failed, closing session");
                state.close();
                state.last_error = Some(reason.clone());
                state.last_outcome = Some(SessionOutcome::SourceFailed(reason));
                smallvec![Effect::None]
            },
        }
    }
}

/// Holds a scan device open; releases it on drop.
pub struct ScanLease {
    source: Arc<dyn ScanSource>,
}

impl ScanLease {
    fn new(source: Arc<dyn ScanSource>) -> Self {
        Self { source }
    }
}

impl Drop for ScanLease {
    fn drop(&mut self) {
        self.source.release();
        tracing::debug!("Scan source released");
    }
}

/// Drives a [`ScanSessionReducer`] store from a [`ScanSource`].
pub struct ScanSessionController {
    store: Store<ScanSessionReducer>,
    source: Arc<dyn ScanSource>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ScanSessionController {
    /// Create a controller in Idle `mode`.
    #[must_use]
    pub fn new(source: Arc<dyn ScanSource>, environment: ScanEnvironment, mode: SessionMode) -> Self {
        Self {
            store: Store::new(ScanSessionState::new(mode), ScanSessionReducer, environment),
            source,
            pump: Mutex::new(None),
        }
    }

    /// The underlying store, for sending operator actions and reading state.
    #[must_use]
    pub const fn store(&self) -> &Store<ScanSessionReducer> {
        &self.store
    }

    /// Acquire the scan source and start feeding scans into the store.
    ///
    /// Calling `start` while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the source's error if it cannot be opened; the session is
    /// then closed with [`SessionOutcome::SourceFailed`].
    pub async fn start(&self) -> Result<(), ScanError> {
        if self.is_running() {
            return Ok(());
        }

        let mut stream = match self.source.open() {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.store.send(ScanAction::SourceFailed(e.to_string())).await;
                return Err(e);
            },
        };
        let lease = ScanLease::new(Arc::clone(&self.source));
        let store = self.store.clone();

        let handle = tokio::spawn(async move {
            let _lease = lease;
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        if store.send(ScanAction::Scanned(event.payload)).await.is_err() {
                            return;
                        }
                    },
                    Err(e) => {
                        let _ = store.send(ScanAction::SourceFailed(e.to_string())).await;
                        return;
                    },
                }
            }
            let _ = store
                .send(ScanAction::SourceFailed("scan stream ended".to_string()))
                .await;
        });

        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::info!("Scan controller started");
        Ok(())
    }

    /// Returns `true` while the pump task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the pump and wait for the source to be released.
    pub async fn stop(&self) {
        let handle = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            tracing::info!("Scan controller stopped");
        }
    }
}

impl Drop for ScanSessionController {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.store.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use equipment_ledger_testing::ReducerTest;
    use equipment_ledger_testing::assertions::{assert_no_effects, assert_runs_work, assert_schedules};

    struct NullDispatcher;

    impl SessionDispatcher for NullDispatcher {
        fn lookup(&self, _reference: String) -> BoxFuture<'_, Option<Item>> {
            Box::pin(async { None })
        }

        fn dispatch(&self, _request: SessionRequest) -> BoxFuture<'_, SessionOutcome> {
            Box::pin(async { SessionOutcome::Cancelled })
        }
    }

    fn env() -> ScanEnvironment {
        ScanEnvironment {
            dispatcher: Arc::new(NullDispatcher),
            session_timeout: Duration::from_secs(120),
            cooldown: Duration::from_millis(1500),
        }
    }

    fn accumulating(mode: SessionMode, refs: &[&str]) -> ScanSessionState {
        ScanSessionState {
            mode,
            phase: Phase::Accumulating,
            generation: 1,
            refs: refs.iter().map(|r| (*r).to_string()).collect(),
            last_scanned: refs.last().map(|r| (*r).to_string()),
            ..ScanSessionState::default()
        }
    }

    fn loan_form() -> ConfirmDetails {
        ConfirmDetails::Loan {
            borrower_key: "ana@school.edu".into(),
            destination: String::new(),
            purpose: String::new(),
            notes: None,
            expected_return_at: None,
        }
    }

    #[test]
    fn scan_while_idle_opens_session_with_timeout() {
        ReducerTest::new(ScanSessionReducer)
            .with_env(env())
            .given_state(ScanSessionState::new(SessionMode::SingleLoan))
            .when_action(ScanAction::Scanned(" QR-001 ".into()))
            .then_state(|s| {
                assert_eq!(s.phase, Phase::Accumulating);
                assert_eq!(s.generation, 1);
                assert_eq!(s.refs, vec!["QR-001".to_string()]);
            })
            .then_effects(|effects| {
                assert_eq!(effects.len(), 2);
                assert_schedules(effects, &ScanAction::TimedOut { generation: 1 });
                assert_runs_work(effects);
            })
            .run();
    }

    #[test]
    fn batch_mode_deduplicates_exact_repeats() {
        ReducerTest::new(ScanSessionReducer)
            .with_env(env())
            .given_state(accumulating(SessionMode::ClassroomBatch, &["A", "B"]))
            .when_action(ScanAction::Scanned("A".into()))
            .then_state(|s| assert_eq!(s.refs, vec!["A".to_string(), "B".to_string()]))
            .then_effects(|effects| assert_no_effects(effects))
            .run();
    }

    #[test]
    fn single_mode_replaces_reference() {
        ReducerTest::new(ScanSessionReducer)
            .with_env(env())
            .given_state(accumulating(SessionMode::SingleReturn, &["A"]))
            .when_action(ScanAction::Scanned("B".into()))
            .then_state(|s| assert_eq!(s.refs, vec!["B".to_string()]))
            .run();
    }

    #[test]
    fn cancel_discards_refs_and_debounces_last_scan() {
        let mut state = accumulating(SessionMode::ClassroomBatch, &["A", "B"]);
        let effects = ScanSessionReducer.reduce(&mut state, ScanAction::Cancel, &env());
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.refs.is_empty());
        assert_eq!(state.last_outcome, Some(SessionOutcome::Cancelled));
        assert_eq!(state.cooldown.as_ref().map(|c| c.reference.as_str()), Some("B"));
        assert!(matches!(effects[0], Effect::Delay { .. }));

        ScanSessionReducer.reduce(&mut state, ScanAction::Scanned("B".into()), &env());
        assert_eq!(state.phase, Phase::Idle);

        ScanSessionReducer.reduce(&mut state, ScanAction::Scanned("C".into()), &env());
        assert_eq!(state.phase, Phase::Accumulating);
        assert!(state.cooldown.is_none());
    }

    #[test]
    fn stale_cooldown_timer_is_ignored() {
        let mut state = ScanSessionState::new(SessionMode::SingleLoan);
        state.last_scanned = Some("A".into());
        ScanSessionReducer.reduce(&mut state, ScanAction::Cancel, &env());
        ScanSessionReducer.reduce(&mut state, ScanAction::Cancel, &env());
        let current = state.cooldown.clone().unwrap();

        ScanSessionReducer.reduce(&mut state, ScanAction::CooldownElapsed { token: current.token - 1 }, &env());
        assert_eq!(state.cooldown, Some(current.clone()));

        ScanSessionReducer.reduce(&mut state, ScanAction::CooldownElapsed { token: current.token }, &env());
        assert!(state.cooldown.is_none());
    }

    #[test]
    fn confirm_requires_matching_form() {
        ReducerTest::new(ScanSessionReducer)
            .with_env(env())
            .given_state(accumulating(SessionMode::SingleReturn, &["A"]))
            .when_action(ScanAction::Confirm(loan_form()))
            .then_state(|s| {
                assert_eq!(s.phase, Phase::Accumulating);
                assert!(s.last_error.is_some());
            })
            .run();
    }

    #[test]
    fn confirm_moves_to_finalizing() {
        ReducerTest::new(ScanSessionReducer)
            .with_env(env())
            .given_state(accumulating(SessionMode::SingleLoan, &["A"]))
            .when_action(ScanAction::Confirm(loan_form()))
            .then_state(|s| assert_eq!(s.phase, Phase::Finalizing))
            .then_effects(|effects| assert_runs_work(effects))
            .run();
    }

    #[test]
    fn timeout_from_earlier_session_is_ignored() {
        let mut state = accumulating(SessionMode::SingleLoan, &["A"]);
        state.generation = 3;
        ScanSessionReducer.reduce(&mut state, ScanAction::TimedOut { generation: 2 }, &env());
        assert_eq!(state.phase, Phase::Accumulating);

        ScanSessionReducer.reduce(&mut state, ScanAction::TimedOut { generation: 3 }, &env());
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.last_outcome, Some(SessionOutcome::TimedOut));
    }

    #[test]
    fn rejection_keeps_refs_for_correction() {
        let mut state = accumulating(SessionMode::SingleLoan, &["A"]);
        state.phase = Phase::Finalizing;
        ScanSessionReducer.reduce(
            &mut state,
            ScanAction::Finished {
                generation: 1,
                outcome: SessionOutcome::Rejected(ReconcileError::BorrowerKeyRequired),
            },
            &env(),
        );
        assert_eq!(state.phase, Phase::Accumulating);
        assert_eq!(state.refs, vec!["A".to_string()]);
        assert!(state.last_error.is_some());
    }

    #[test]
    fn source_failure_closes_session() {
        let mut state = accumulating(SessionMode::ClassroomBatch, &["A"]);
        ScanSessionReducer.reduce(&mut state, ScanAction::SourceFailed("camera lost".into()), &env());
        assert!(!state.is_open());
        assert!(state.refs.is_empty());
        assert_eq!(
            state.last_outcome,
            Some(SessionOutcome::SourceFailed("camera lost".into()))
        );
    }
}
