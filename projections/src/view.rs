//! Live view over both stores.
//!
//! [`LiveLedgerView`] follows the inventory and ledger feeds, refreshes the
//! shared [`ItemCache`] on every inventory update and republishes the
//! composed timeline through a `watch` channel.

use crate::feed::{self, Feed};
use crate::timeline::{self, BorrowerGroup, ClassroomHeuristic, ItemDirectory, NoDirectory, TimelineEntry};
use equipment_ledger_core::catalog::{CatalogIndex, ItemCache};
use equipment_ledger_core::item::Item;
use equipment_ledger_core::loan::{LoanEvent, LoanQuery};
use equipment_ledger_core::store::{InventoryStore, LedgerStore};
use equipment_ledger_runtime::RetryPolicy;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One published state of the view.
#[derive(Clone, Debug, Default)]
pub struct LedgerView {
    /// Bumped on every published change
    pub revision: u64,
    /// Item cache generation the view was built from (0 before the first
    /// inventory delivery)
    pub inventory_generation: u64,
    /// Catalog of the latest inventory delivery
    pub catalog: Option<Arc<CatalogIndex>>,
    /// Ledger rows of the latest delivery, newest first
    pub loans: Vec<LoanEvent>,
    /// Composed timeline over `loans`
    pub timeline: Vec<TimelineEntry>,
}

impl LedgerView {
    fn directory(&self) -> &dyn ItemDirectory {
        match &self.catalog {
            Some(catalog) => catalog.as_ref(),
            None => &NoDirectory,
        }
    }

    /// Items of the latest inventory delivery.
    #[must_use]
    pub fn items(&self) -> &[Item] {
        self.catalog.as_deref().map_or(&[] as &[Item], CatalogIndex::items)
    }

    /// Rows grouped by borrower.
    #[must_use]
    pub fn borrowers(&self) -> Vec<BorrowerGroup> {
        timeline::group_by_borrower(&self.loans, self.directory())
    }

    /// Rows still out.
    pub fn open_loans(&self) -> impl Iterator<Item = &LoanEvent> {
        self.loans.iter().filter(|loan| loan.is_open())
    }

    fn recompose(&mut self) {
        self.timeline = timeline::compose(&self.loans, self.directory(), &ClassroomHeuristic);
    }
}

/// Background task publishing [`LedgerView`]s.
pub struct LiveLedgerView {
    view: watch::Receiver<Arc<LedgerView>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LiveLedgerView {
    /// Start following both stores.
    ///
    /// `query` selects the ledger rows shown on the timeline. Feed failures
    /// are retried per `retry` and never stop the view.
    #[must_use]
    pub fn spawn(
        inventory: Arc<dyn InventoryStore>,
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<ItemCache>,
        query: LoanQuery,
        retry: RetryPolicy,
    ) -> Self {
        let (view_tx, view_rx) = watch::channel(Arc::new(LedgerView::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inventory = feed::inventory_feed(inventory, Arc::clone(&cache), retry.clone());
        let ledger = feed::ledger_feed(ledger, query, retry);
        let task = tokio::spawn(run(inventory, ledger, cache, view_tx, shutdown_rx));

        Self {
            view: view_rx,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    /// The latest published view.
    #[must_use]
    pub fn current(&self) -> Arc<LedgerView> {
        Arc::clone(&self.view.borrow())
    }

    /// A receiver notified on every published change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<LedgerView>> {
        self.view.clone()
    }

    /// Stop the background task and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::info!("Live ledger view stopped");
    }
}

impl Drop for LiveLedgerView {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    mut inventory: Feed<Item>,
    mut ledger: Feed<LoanEvent>,
    cache: Arc<ItemCache>,
    publish: watch::Sender<Arc<LedgerView>>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Live ledger view started");
    let mut state = LedgerView::default();

    loop {
        tokio::select! {
            Some(items) = inventory.next() => {
                let count = items.len();
                state.inventory_generation = cache.refresh(items);
                state.catalog = cache.last_known();
                tracing::debug!(items = count, generation = state.inventory_generation, "Inventory update");
            }
            Some(loans) = ledger.next() => {
                tracing::debug!(loans = loans.len(), "Ledger update");
                state.loans = loans;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        state.revision += 1;
        state.recompose();
        publish.send_replace(Arc::new(state.clone()));
    }
}
