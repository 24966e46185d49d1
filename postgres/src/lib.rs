//! `PostgreSQL` adapter for the equipment ledger.
//!
//! Both collections are JSONB document tables:
//!
//! - `loan_events`: the append-only ledger, with filter columns copied out of
//!   the document for pushed-down queries
//! - `inventory_items`: the current-state projection, patched in place
//!
//! Statement-level triggers publish `NOTIFY` on every write, which drives the
//! live subscriptions.
//!
//! # Example
//!
//! ```no_run
//! use equipment_ledger_core::environment::SystemClock;
//! use equipment_ledger_postgres::{PostgresConfig, PostgresInventoryStore, PostgresLedgerStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PostgresConfig::from_env()?.connect().await?;
//! equipment_ledger_postgres::migrate(&pool).await?;
//!
//! let clock = Arc::new(SystemClock);
//! let ledger = PostgresLedgerStore::new(pool.clone(), clock.clone());
//! let inventory = PostgresInventoryStore::new(pool, clock);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod inventory;
mod ledger;
mod listen;

pub use config::PostgresConfig;
pub use error::PostgresError;
pub use inventory::PostgresInventoryStore;
pub use ledger::PostgresLedgerStore;
pub use listen::{INVENTORY_CHANNEL, LEDGER_CHANNEL};

/// Apply the bundled schema migrations.
///
/// # Errors
///
/// Returns [`PostgresError::Migrate`] if a migration fails.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), PostgresError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Applied ledger migrations");
    Ok(())
}
