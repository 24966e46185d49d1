//! Identity resolution cascade and cache fallback.

#![allow(clippy::unwrap_used)]

mod common;

use common::Harness;
use equipment_ledger_core::catalog::{CatalogIndex, InventorySnapshot, MatchKind, SNAPSHOT_KEY};
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::item::{ItemStatus, NewItem};
use equipment_ledger_core::cache::{CacheFuture, LocalCache};
use equipment_ledger_core::catalog::ItemCache;
use equipment_ledger_runtime::{IdentityResolver, LedgerConfig, ResolveError, Snapshot, SnapshotSource};
use equipment_ledger_testing::properties::{scan_code, sloppy};
use equipment_ledger_testing::{Operation, base_time, fixtures};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn cascade_prefers_exact_steps() {
    let h = Harness::new();
    let items = h.seed(vec![fixtures::projector(), fixtures::speaker()]).await;
    let resolver = h.resolver();

    let cases = [
        (items[0].id.as_str().to_string(), MatchKind::Id),
        ("QR-0001".to_string(), MatchKind::ScanCode),
        ("QR 0001".to_string(), MatchKind::ScanCodeStripped),
        ("JBL 5520 A".to_string(), MatchKind::Serial),
        ("JBL5520A".to_string(), MatchKind::SerialStripped),
        ("Parlante JBL".to_string(), MatchKind::DisplayName),
        ("parlante  jbl!".to_string(), MatchKind::NormalizedName),
        ("epson powerlite x49".to_string(), MatchKind::NormalizedBrandModel),
    ];
    for (reference, kind) in cases {
        let resolution = resolver.resolve(&reference).await.unwrap();
        assert_eq!(resolution.kind, kind, "{reference}");
    }
}

#[tokio::test]
async fn unknown_and_blank_references_are_errors() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let resolver = h.resolver();

    assert_eq!(
        resolver.resolve("  ").await.unwrap_err(),
        ResolveError::EmptyReference
    );
    assert_eq!(
        resolver.resolve("Microscopio").await.unwrap_err(),
        ResolveError::NotFound("Microscopio".into())
    );
}

#[tokio::test]
async fn fuzzy_collision_prefers_loaned_item() {
    let h = Harness::new();
    let items = h
        .seed(vec![NewItem::named("Cámara Canon"), NewItem::named("Camara Canon ")])
        .await;
    h.reconciler
        .register_loan(equipment_ledger_runtime::LoanRequest::new(items[1].id.as_str(), "ana@school.edu"))
        .await
        .unwrap();

    let resolution = h.resolver().resolve("camara canon").await.unwrap();
    assert_eq!(resolution.item.id, items[1].id);
    assert_eq!(resolution.candidates, 2);
    assert_eq!(resolution.item.status, ItemStatus::Loaned);
}

#[tokio::test]
async fn warm_cache_avoids_repeated_reads() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let resolver = h.resolver();

    assert_eq!(resolver.resolve("QR-0001").await.unwrap().source, SnapshotSource::Live);
    assert_eq!(resolver.resolve("QR-0001").await.unwrap().source, SnapshotSource::Cache);
    assert_eq!(h.store.calls(Operation::InventoryRead), 1);
}

#[tokio::test]
async fn offline_lookup_falls_back_to_stale_cache() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let resolver = h.resolver();
    resolver.resolve("QR-0001").await.unwrap();

    h.cache.invalidate();
    h.store.set_offline(true);
    let resolution = resolver.resolve("QR-0001").await.unwrap();
    assert_eq!(resolution.source, SnapshotSource::StaleCache);
    assert!(resolution.source.is_fallback());
}

#[tokio::test]
async fn cold_cache_falls_back_to_local_snapshot() {
    let h = Harness::new();
    let items = h.seed(vec![fixtures::projector()]).await;
    let snapshot = InventorySnapshot {
        taken_at: base_time(),
        items: items.clone(),
    };
    h.local.set(SNAPSHOT_KEY, snapshot.to_bytes().unwrap()).await.unwrap();
    h.store.set_offline(true);

    let resolution = h.resolver().resolve("QR-0001").await.unwrap();
    assert_eq!(resolution.source, SnapshotSource::LocalCache);
    assert_eq!(resolution.item.id, items[0].id);
}

#[tokio::test]
async fn live_read_persists_snapshot_for_next_session() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    h.resolver().resolve("QR-0001").await.unwrap();
    assert!(h.local.contains(SNAPSHOT_KEY));
}

#[tokio::test]
async fn no_snapshot_anywhere_surfaces_store_error() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    h.store.set_offline(true);

    let err = h.resolver().resolve("QR-0001").await.unwrap_err();
    assert!(matches!(err, ResolveError::Store(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn permanent_store_error_is_not_masked_by_cache() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let resolver = h.resolver();
    resolver.resolve("QR-0001").await.unwrap();
    h.cache.invalidate();
    h.store.fail_next(
        Operation::InventoryRead,
        1,
        StoreError::NotFound {
            collection: "inventory",
            id: "all".into(),
        },
    );

    assert!(matches!(
        resolver.resolve("QR-0001").await.unwrap_err(),
        ResolveError::Store(StoreError::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn slow_live_read_times_out_into_fallback() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let resolver = h.resolver();
    resolver.resolve("QR-0001").await.unwrap();
    h.cache.invalidate();
    h.store.set_latency(Duration::from_secs(10));

    let resolution = resolver.resolve("QR-0001").await.unwrap();
    assert_eq!(resolution.source, SnapshotSource::StaleCache);
}

/// A local cache that never answers.
struct StuckCache;

impl LocalCache for StuckCache {
    fn get(&self, _key: &str) -> CacheFuture<'_, Option<Vec<u8>>> {
        Box::pin(futures::future::pending())
    }

    fn set(&self, _key: &str, _value: Vec<u8>) -> CacheFuture<'_, ()> {
        Box::pin(futures::future::pending())
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_local_cache_never_blocks_resolution() {
    let h = Harness::new();
    h.seed(vec![fixtures::projector()]).await;
    let resolver_with = |cache: Arc<ItemCache>| {
        IdentityResolver::new(
            Arc::new(h.store.clone()),
            cache,
            Arc::new(StuckCache),
            h.clock.clone(),
            LedgerConfig::default().lookup_timeout,
        )
    };

    let live = tokio::time::timeout(
        Duration::from_secs(60),
        resolver_with(Arc::new(ItemCache::new())).resolve("QR-0001"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(live.source, SnapshotSource::Live);

    h.store.set_offline(true);
    let cold = tokio::time::timeout(
        Duration::from_secs(60),
        resolver_with(Arc::new(ItemCache::new())).resolve("QR-0001"),
    )
    .await
    .unwrap();
    assert!(matches!(cold, Err(ResolveError::Store(StoreError::Unavailable(_)))));
}

#[tokio::test]
async fn resolve_many_uses_one_snapshot() {
    let h = Harness::new();
    h.seed(vec![fixtures::tablet(1), fixtures::tablet(2)]).await;

    let results = h
        .resolver()
        .resolve_many(&["QR-1001".into(), "nope".into(), "TAB-0002".into()])
        .await
        .unwrap();
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());
    assert_eq!(h.store.calls(Operation::InventoryRead), 1);
}

fn snapshot_of(codes: &[String]) -> Snapshot {
    let items = codes
        .iter()
        .enumerate()
        .map(|(n, code)| {
            NewItem::named(format!("Equipo {n}"))
                .with_scan_code(code.clone())
                .into_item(format!("item-{n:04}").into(), base_time())
        })
        .collect();
    Snapshot {
        index: Arc::new(CatalogIndex::build(items)),
        source: SnapshotSource::Live,
    }
}

proptest! {
    #[test]
    fn sloppy_entry_of_scan_code_resolves_to_same_item(
        (code, entry) in scan_code().prop_flat_map(|code| (Just(code.clone()), sloppy(code)))
    ) {
        let snapshot = snapshot_of(&[code.clone(), "ZZ-0".to_string()]);
        let resolution = snapshot.resolve(&entry).unwrap();
        prop_assert_eq!(resolution.item.scan_code, code);
    }

    #[test]
    fn whitespace_padding_never_changes_the_match(code in scan_code(), pad in "[ \t]{0,3}") {
        let snapshot = snapshot_of(&[code.clone()]);
        let padded = format!("{pad}{code}{pad}");
        prop_assert_eq!(
            snapshot.resolve(&padded).unwrap().kind,
            snapshot.resolve(&code).unwrap().kind
        );
    }
}
