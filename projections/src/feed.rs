//! Live feeds that survive store subscription failures.
//!
//! A store subscription ends after its first error. The feeds here log the
//! failure, back off per the [`RetryPolicy`] and resubscribe, so consumers
//! see an endless sequence of full result sets and never an error.
//!
//! The inventory feed also invalidates the session [`ItemCache`] whenever its
//! subscription fails, so lookups stop trusting the cache during an outage.

use equipment_ledger_core::catalog::ItemCache;
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::item::Item;
use equipment_ledger_core::loan::{LoanEvent, LoanQuery};
use equipment_ledger_core::store::{InventoryStore, LedgerStore, LiveQuery};
use equipment_ledger_runtime::RetryPolicy;
use equipment_ledger_runtime::metrics::FeedMetrics;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// An infallible live feed of full result sets.
pub type Feed<T> = Pin<Box<dyn Stream<Item = Vec<T>> + Send>>;

/// Wrap a subscription factory into a feed that resubscribes on error.
///
/// `open` is called for the first subscription and after every failure or
/// end of stream. `on_failure` sees every subscription error. The backoff
/// resets once a result set is delivered.
pub fn resubscribing<T, F, Fut, E>(
    feed: &'static str,
    policy: RetryPolicy,
    mut open: F,
    on_failure: E,
) -> Feed<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<LiveQuery<T>, StoreError>> + Send,
    E: Fn(&StoreError) + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut failures = 0usize;
        loop {
            match open().await {
                Ok(mut live) => {
                    while let Some(next) = live.next().await {
                        match next {
                            Ok(rows) => {
                                failures = 0;
                                yield rows;
                            },
                            Err(e) => {
                                tracing::warn!(feed, error = %e, "Live feed failed");
                                on_failure(&e);
                                break;
                            },
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(feed, error = %e, failures, "Could not open live feed");
                    on_failure(&e);
                },
            }

            let delay = policy.delay_for_attempt(failures.min(policy.max_retries));
            failures = failures.saturating_add(1);
            FeedMetrics::record_resubscribe(feed);
            tracing::debug!(feed, ?delay, "Resubscribing");
            tokio::time::sleep(delay).await;
        }
    })
}

/// Full inventory, redelivered on every change. A subscription failure
/// marks `cache` stale.
#[must_use]
pub fn inventory_feed(store: Arc<dyn InventoryStore>, cache: Arc<ItemCache>, policy: RetryPolicy) -> Feed<Item> {
    resubscribing(
        "inventory",
        policy,
        move || {
            let store = Arc::clone(&store);
            async move { store.subscribe().await }
        },
        move |_| cache.invalidate(),
    )
}

/// Ledger rows matching `query`, redelivered on every change.
#[must_use]
pub fn ledger_feed(store: Arc<dyn LedgerStore>, query: LoanQuery, policy: RetryPolicy) -> Feed<LoanEvent> {
    resubscribing(
        "ledger",
        policy,
        move || {
            let store = Arc::clone(&store);
            let query = query.clone();
            async move { store.subscribe(query).await }
        },
        |_| {},
    )
}
