//! Adapter errors and their mapping onto [`StoreError`].

use equipment_ledger_core::error::StoreError;
use thiserror::Error;

/// Errors from setting up the adapter.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// Missing or invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The pool could not connect
    #[error("failed to connect: {0}")]
    Connect(#[source] sqlx::Error),

    /// Schema migration failed
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Map a driver error onto the store contract.
///
/// Connectivity problems are transient; constraint violations are conflicts.
pub(crate) fn store_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        },
        _ => StoreError::Unavailable(e.to_string()),
    }
}

/// Map a listener error onto the store contract.
pub(crate) fn subscription_error(e: &sqlx::Error) -> StoreError {
    StoreError::Subscription(e.to_string())
}
