//! Read-side projections for the equipment ledger.
//!
//! # Overview
//!
//! - **Timeline** ([`timeline`]): classroom groups and individual loans
//!   ordered by recency, plus per-borrower grouping
//! - **Feeds** ([`feed`]): store subscriptions that resubscribe on error
//! - **Live view** ([`view`]): keeps the item cache and the timeline current
//!   from both feeds
//!
//! # Example
//!
//! ```ignore
//! use equipment_ledger_projections::{LiveLedgerView, TimelineEntry};
//!
//! let view = LiveLedgerView::spawn(inventory, ledger, cache, LoanQuery::all(), config.feed_retry);
//! let mut updates = view.subscribe();
//!
//! while updates.changed().await.is_ok() {
//!     for entry in &updates.borrow().timeline {
//!         render(entry);
//!     }
//! }
//! ```

pub mod feed;
pub mod timeline;
pub mod view;

pub use feed::{Feed, inventory_feed, ledger_feed, resubscribing};
pub use timeline::{
    BorrowerGroup, ClassroomGroup, ClassroomHeuristic, ClassroomPredicate, ItemDirectory, LabelOnly,
    NoDirectory, TimelineEntry, TimelineLoan, compose, group_by_borrower,
};
pub use view::{LedgerView, LiveLedgerView};
