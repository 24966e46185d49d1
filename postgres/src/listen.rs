//! Live queries over `LISTEN`/`NOTIFY`.
//!
//! The migration installs statement-level triggers that notify a channel per
//! table. A subscription re-runs its query after every notification and
//! delivers the full result set.

use crate::error::subscription_error;
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::store::LiveQuery;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::future::Future;

/// Channel notified on inventory writes.
pub const INVENTORY_CHANNEL: &str = "inventory_changes";
/// Channel notified on ledger writes.
pub const LEDGER_CHANNEL: &str = "ledger_changes";

/// Open a live query on `channel`, running `fetch` for the initial snapshot
/// and after each change.
///
/// The stream yields one `Err` and ends when the listener or a re-query fails.
pub(crate) async fn live_query<T, F, Fut>(
    pool: &PgPool,
    channel: &'static str,
    fetch: F,
) -> Result<LiveQuery<T>, StoreError>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>, StoreError>> + Send + 'static,
{
    let mut listener = PgListener::connect_with(pool)
        .await
        .map_err(|e| subscription_error(&e))?;
    listener
        .listen(channel)
        .await
        .map_err(|e| subscription_error(&e))?;
    tracing::debug!(channel, "Listening for changes");

    let stream: LiveQuery<T> = Box::pin(async_stream::stream! {
        loop {
            match fetch().await {
                Ok(rows) => yield Ok(rows),
                Err(e) => {
                    yield Err(e);
                    break;
                },
            }

            // `Ok(None)` means the connection dropped and the listener will
            // reconnect; notifications may have been missed, so re-query.
            match listener.try_recv().await {
                Ok(Some(_)) => {},
                Ok(None) => tracing::warn!(channel, "Listener reconnecting"),
                Err(e) => {
                    yield Err(subscription_error(&e));
                    break;
                },
            }
        }
    });
    Ok(stream)
}
