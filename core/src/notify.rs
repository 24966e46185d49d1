//! Fire-and-forget notification collaborator.
//!
//! A notice is sent after a loan or return has been recorded. Delivery
//! failures are logged by the caller and never fail the ledger operation.

use crate::item::ItemId;
use crate::loan::LoanId;
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// An item went out
    LoanRegistered,
    /// An item came back
    ReturnRegistered,
    /// A classroom batch was processed
    ClassroomBatch,
}

/// Payload of a ledger notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerNotice {
    /// What happened
    pub kind: NoticeKind,
    /// Items involved
    pub items: Vec<ItemId>,
    /// Ledger rows involved
    pub loans: Vec<LoanId>,
    /// Borrower or classroom label
    pub borrower_key: Option<String>,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Notification delivery failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Boxed future returned by [`Notifier::notify`].
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// "A loan event occurred" signal.
pub trait Notifier: Send + Sync {
    /// Deliver a notice.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] on delivery failure.
    fn notify(&self, notice: LedgerNotice) -> NotifyFuture<'_>;
}

/// Notifier that drops every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notice: LedgerNotice) -> NotifyFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}
