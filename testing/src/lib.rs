//! # Equipment Ledger Testing
//!
//! Test doubles and helpers for the equipment loan ledger.
//!
//! This crate provides:
//! - [`InMemoryDocumentStore`]: both store contracts with fault injection
//! - Mock collaborators: clocks, notifier, local cache, scan source
//! - [`ReducerTest`]: Given-When-Then for reducers
//! - Fixtures and the [`assert_projection_consistent`] invariant check
//! - proptest strategies for scan payloads
//!
//! ## Example
//!
//! ```ignore
//! use equipment_ledger_testing::{InMemoryDocumentStore, fixtures, test_clock};
//!
//! #[tokio::test]
//! async fn projector_starts_available() {
//!     let store = InMemoryDocumentStore::new(Arc::new(test_clock()));
//!     let items = fixtures::seed(&store, vec![fixtures::projector()]).await.unwrap();
//!     assert_eq!(items[0].status, ItemStatus::Available);
//! }
//! ```

pub mod fixtures;
pub mod invariants;
pub mod memory_store;
pub mod mocks;
pub mod reducer_test;

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Scan codes shaped like printed labels, e.g. `QR-0042` or `TAB-7`.
    pub fn scan_code() -> impl Strategy<Value = String> {
        "[A-Z]{2,4}-[0-9]{1,5}"
    }

    /// `code` as a sloppy manual entry: hyphens dropped or doubled, spaces
    /// inserted.
    pub fn sloppy(code: String) -> impl Strategy<Value = String> {
        prop::collection::vec(prop_oneof![Just(""), Just(" "), Just("-")], code.len()).prop_map(
            move |separators| {
                code.chars()
                    .filter(|c| *c != '-')
                    .zip(separators)
                    .map(|(c, sep)| format!("{sep}{c}"))
                    .collect()
            },
        )
    }
}

/// Install a test-writer subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub use invariants::{assert_projection_consistent, projection_violations};
pub use memory_store::{InMemoryDocumentStore, Operation};
pub use mocks::{
    ChannelScanSource, FixedClock, InMemoryLocalCache, ManualClock, RecordingNotifier,
    base_time, test_clock,
};
pub use reducer_test::{ReducerTest, assertions};
