//! # Equipment Ledger Runtime
//!
//! The reconciliation engine for the equipment loan ledger.
//!
//! ## Core Components
//!
//! - **Identity Resolver** ([`resolver`]): raw reference → canonical item,
//!   with cache fallback when the live store is slow or offline
//! - **Reconciler** ([`reconciler`]): ledger-before-projection writes for
//!   loans, returns and classroom batches
//! - **Scan Session** ([`scan_session`]): reducer and controller that
//!   accumulate scans for one operator action
//! - **Store** ([`store`]): the action runtime driving reducers
//! - **Consistency Sweep** ([`sweep`]): ledger/projection audit and overdue marking
//!
//! ## Example
//!
//! ```ignore
//! use equipment_ledger_runtime::{LedgerConfig, Reconciler, IdentityResolver, LoanRequest};
//!
//! let config = LedgerConfig::from_env();
//! let resolver = IdentityResolver::new(inventory.clone(), cache, local, clock.clone(), config.lookup_timeout);
//! let reconciler = Reconciler::new(ledger, inventory, resolver, notifier, clock, &config);
//!
//! let outcome = reconciler
//!     .register_loan(LoanRequest::new("QR-0042", "ana@school.edu"))
//!     .await?;
//! assert!(outcome.sync.is_synced());
//! ```

/// Environment-driven configuration
pub mod config;

/// Ledger metrics and the Prometheus exporter
pub mod metrics;

/// Ledger-before-projection writes
pub mod reconciler;

/// Identity resolution with cache fallback
pub mod resolver;

/// Retry logic with exponential backoff
pub mod retry;

/// Scan session reducer and controller
pub mod scan_session;

/// Action runtime for reducers
pub mod store;

/// Ledger/projection audit
pub mod sweep;

pub use config::LedgerConfig;
pub use reconciler::{
    BatchFailure, BatchFailureReason, BatchMode, BatchOutcome, ClassroomBatchRequest,
    LedgerReceipt, LoanOutcome, LoanRequest, ReconcileError, Reconciler, ResyncOutcome,
    ReturnAnomaly, ReturnOutcome, ReturnRequest, SyncStatus,
};
pub use resolver::{IdentityResolver, Resolution, ResolveError, Snapshot, SnapshotSource};
pub use retry::RetryPolicy;
pub use scan_session::{
    ConfirmDetails, Phase, ScanAction, ScanEnvironment, ScanSessionController,
    ScanSessionReducer, ScanSessionState, SessionDispatcher, SessionMode, SessionOutcome,
    SessionRequest,
};
pub use store::Store;
pub use sweep::{AuditReport, ConsistencySweep, Mismatch};
