//! Store error types.

use crate::document::DocumentError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`crate::store::LedgerStore`] and
/// [`crate::store::InventoryStore`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete in time
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// No document with this id exists
    #[error("{collection}/{id} not found")]
    NotFound {
        /// Collection name
        collection: &'static str,
        /// Document id
        id: String,
    },

    /// A conditional write lost a race (e.g. closing a loan that is no
    /// longer open)
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored document failed validation
    #[error(transparent)]
    Malformed(#[from] DocumentError),

    /// A live subscription failed
    #[error("subscription error: {0}")]
    Subscription(String),
}

impl StoreError {
    /// Returns `true` for failures worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Subscription(_)
        )
    }
}

/// Convenience alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;
