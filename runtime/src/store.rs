//! Store runtime: owns reducer state and executes effects.
//!
//! The Store manages:
//! 1. State (behind `RwLock` for concurrent access)
//! 2. Reducer (decision logic)
//! 3. Environment (injected collaborators)
//! 4. Effect execution, feeding produced actions back into the reducer
//!
//! Every action the reducer processes is broadcast to observers after the
//! state change, so callers can wait for a result action with
//! [`Store::send_and_wait_for`].

use equipment_ledger_core::effect::Effect;
use equipment_ledger_core::reducer::Reducer;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, watch};

/// Store runtime errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is shutting down and no longer accepts actions
    #[error("Store is shutting down")]
    ShutdownInProgress,

    /// No matching action arrived in time
    #[error("Timed out waiting for action after {0:?}")]
    Timeout(Duration),

    /// The action broadcast channel closed
    #[error("Action broadcast channel closed")]
    ChannelClosed,
}

struct Inner<R: Reducer> {
    state: RwLock<R::State>,
    reducer: R,
    environment: R::Environment,
    actions: broadcast::Sender<R::Action>,
    shutdown: AtomicBool,
    running: AtomicUsize,
    settled: watch::Sender<usize>,
}

/// Decrements the running-effect counter on drop, even if the task panics.
struct RunningGuard<R: Reducer>(Arc<Inner<R>>);

impl<R: Reducer> RunningGuard<R> {
    fn enter(inner: &Arc<Inner<R>>) -> Self {
        let running = inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        inner.settled.send_replace(running);
        Self(Arc::clone(inner))
    }
}

impl<R: Reducer> Drop for RunningGuard<R> {
    fn drop(&mut self) {
        let running = self.0.running.fetch_sub(1, Ordering::SeqCst) - 1;
        self.0.settled.send_replace(running);
    }
}

/// Runtime coordinator for one reducer.
///
/// Cheap to clone; clones share state.
pub struct Store<R: Reducer> {
    inner: Arc<Inner<R>>,
}

impl<R: Reducer> Clone for Store<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> Store<R>
where
    R: Reducer + Send + Sync + 'static,
    R::State: Send + Sync + 'static,
    R::Action: Clone + Send + Sync + std::fmt::Debug + 'static,
    R::Environment: Send + Sync + 'static,
{
    /// Create a store with initial state, reducer, and environment.
    #[must_use]
    pub fn new(initial_state: R::State, reducer: R, environment: R::Environment) -> Self {
        Self::with_broadcast_capacity(initial_state, reducer, environment, 64)
    }

    /// Create a store with a custom action broadcast capacity.
    #[must_use]
    pub fn with_broadcast_capacity(
        initial_state: R::State,
        reducer: R,
        environment: R::Environment,
        capacity: usize,
    ) -> Self {
        let (actions, _) = broadcast::channel(capacity.max(1));
        let (settled, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(initial_state),
                reducer,
                environment,
                actions,
                shutdown: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                settled,
            }),
        }
    }

    /// Send an action to the store.
    ///
    /// 1. Acquires the write lock on state
    /// 2. Calls the reducer
    /// 3. Broadcasts the action to observers
    /// 4. Starts executing the returned effects (does not wait for them)
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
    pub async fn send(&self, action: R::Action) -> Result<(), StoreError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            tracing::debug!(?action, "Store shut down, dropping action");
            return Err(StoreError::ShutdownInProgress);
        }

        let effects = {
            let mut state = self.inner.state.write().await;
            self.inner
                .reducer
                .reduce(&mut state, action.clone(), &self.inner.environment)
        };

        // No receivers is fine
        let _ = self.inner.actions.send(action);

        for effect in effects {
            self.execute(effect);
        }
        Ok(())
    }

    /// Send `action`, then wait for the first broadcast action matching
    /// `predicate`.
    ///
    /// The subscription is taken before sending, so a result produced by the
    /// action's own effects cannot be missed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ShutdownInProgress`] if the store is shutting down
    /// - [`StoreError::Timeout`] if no matching action arrives in time
    /// - [`StoreError::ChannelClosed`] if the broadcast channel closes
    pub async fn send_and_wait_for<F>(
        &self,
        action: R::Action,
        predicate: F,
        timeout: Duration,
    ) -> Result<R::Action, StoreError>
    where
        F: Fn(&R::Action) -> bool,
    {
        let mut rx = self.inner.actions.subscribe();
        self.send(action).await?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(action) if predicate(&action) => return Ok(action),
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Action observer lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(StoreError::ChannelClosed);
                    },
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }

    /// Observe every action processed from now on.
    #[must_use]
    pub fn subscribe_actions(&self) -> broadcast::Receiver<R::Action> {
        self.inner.actions.subscribe()
    }

    /// Read state through a closure.
    pub async fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&R::State) -> T,
    {
        let state = self.inner.state.read().await;
        f(&state)
    }

    /// Wait until no `Future`/`Sequential` effect is running.
    ///
    /// Scheduled [`Effect::Delay`] timers are not waited for.
    pub async fn settled(&self) {
        let mut rx = self.inner.settled.subscribe();
        loop {
            let running = *rx.borrow_and_update();
            if running == 0 || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop accepting actions. Pending timers fire into a closed store and
    /// are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    fn execute(&self, effect: Effect<R::Action>) {
        match effect {
            Effect::None => {},
            Effect::Delay { duration, action } => {
                let store = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    tracing::trace!(?action, "Effect::Delay elapsed");
                    let _ = store.send(*action).await;
                });
            },
            Effect::Parallel(effects) => {
                for effect in effects {
                    self.execute(effect);
                }
            },
            effect @ (Effect::Future(_) | Effect::Sequential(_)) => {
                let guard = RunningGuard::enter(&self.inner);
                let store = self.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    store.run(effect).await;
                });
            },
        }
    }

    /// Run an effect to completion within the current task.
    fn run(&self, effect: Effect<R::Action>) -> BoxFuture<'static, ()> {
        let store = self.clone();
        Box::pin(async move {
            match effect {
                Effect::Future(fut) => {
                    if let Some(action) = fut.await {
                        let _ = store.send(action).await;
                    }
                },
                Effect::Sequential(effects) => {
                    for effect in effects {
                        store.run(effect).await;
                    }
                },
                other => store.execute(other),
            }
        })
    }
}
