//! # Equipment Ledger Core
//!
//! Core types and contracts for the equipment loan ledger.
//!
//! The ledger tracks physical equipment (laptops) as it moves between the
//! inventory pool and borrowers. Two record families live in the backing
//! document store:
//!
//! - **Ledger** ([`loan::LoanEvent`]): append-only loan/return events, the
//!   durable source of truth.
//! - **Inventory projection** ([`item::Item`]): one mutable current-state
//!   record per item, used for fast lookup and display.
//!
//! ## Crate Layout
//!
//! - [`item`], [`loan`]: explicit record shapes with required/optional fields
//! - [`document`]: decoding of raw store documents at the adapter boundary
//! - [`normalize`]: code stripping and accent/case-insensitive text keys
//! - [`catalog`]: the identity lookup cascade over an inventory snapshot,
//!   plus the per-session item cache
//! - [`store`]: [`store::LedgerStore`] and [`store::InventoryStore`] traits
//! - [`cache`], [`notify`], [`scan`]: external collaborator contracts
//! - [`reducer`], [`effect`], [`environment`]: the state-machine abstractions
//!   used by scan sessions
//!
//! ## Write Path
//!
//! ```text
//! scan refs ──► resolve identity ──► append ledger ──► apply projection
//!                (catalog)            (LedgerStore)     (InventoryStore)
//! ```
//!
//! The ledger write always happens before the projection write. There is no
//! transaction spanning the two collections.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

pub mod cache;
pub mod catalog;
pub mod document;
pub mod error;
pub mod item;
pub mod loan;
pub mod normalize;
pub mod notify;
pub mod scan;
pub mod store;

/// Reducer module - the trait for pure state machines.
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They contain the decision logic and are deterministic and testable without
/// any runtime.
pub mod reducer {
    use super::SmallVec;
    use super::effect::Effect;

    /// The Reducer trait - core abstraction for state machines
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for ScanSessionReducer {
    ///     type State = ScanSessionState;
    ///     type Action = ScanAction;
    ///     type Environment = ScanEnvironment;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut ScanSessionState,
    ///         action: ScanAction,
    ///         env: &ScanEnvironment,
    ///     ) -> SmallVec<[Effect<ScanAction>; 4]> {
    ///         smallvec![Effect::None]
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action against the current state
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed by a runtime
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - side effect descriptions.
///
/// Effects describe side effects to be performed by a runtime. They are values
/// (not execution), so reducers stay pure and tests can inspect them.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed immediately. They are descriptions of what should
    /// happen, returned from reducers and executed by the Store runtime.
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action (for timeouts and cooldowns)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Dispatch `action` after `duration`
        #[must_use]
        pub fn delay(duration: Duration, action: Action) -> Effect<Action> {
            Effect::Delay {
                duration,
                action: Box::new(action),
            }
        }

        /// Returns `true` for [`Effect::None`]
        #[must_use]
        pub const fn is_none(&self) -> bool {
            matches!(self, Effect::None)
        }
    }
}

/// Environment module - dependency injection traits.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Every timestamp written to the ledger or projection comes from a
    /// `Clock`, so tests can pin or advance time deterministically.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use std::time::Duration;

    #[test]
    fn delay_effect_debug_includes_action() {
        let effect = Effect::delay(Duration::from_millis(5), "tick");
        let debug = format!("{effect:?}");
        assert!(debug.contains("Effect::Delay"));
        assert!(debug.contains("tick"));
    }

    #[test]
    fn future_effect_debug_is_opaque() {
        let effect: Effect<()> = Effect::Future(Box::pin(async { None }));
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");
        assert!(!effect.is_none());
    }
}
