#![allow(dead_code, clippy::unwrap_used)]

use equipment_ledger_core::catalog::ItemCache;
use equipment_ledger_core::item::{Item, NewItem};
use equipment_ledger_runtime::{IdentityResolver, LedgerConfig, Reconciler, RetryPolicy};
use equipment_ledger_testing::{
    InMemoryDocumentStore, InMemoryLocalCache, ManualClock, RecordingNotifier,
    assert_projection_consistent, fixtures,
};
use std::sync::Arc;
use std::time::Duration;

pub fn config() -> LedgerConfig {
    LedgerConfig {
        projection_retry: RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build(),
        ..LedgerConfig::default()
    }
}

pub struct Harness {
    pub store: InMemoryDocumentStore,
    pub clock: Arc<ManualClock>,
    pub cache: Arc<ItemCache>,
    pub local: Arc<InMemoryLocalCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&config())
    }

    pub fn with_config(config: &LedgerConfig) -> Self {
        equipment_ledger_testing::init_tracing();
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryDocumentStore::new(clock.clone());
        let cache = Arc::new(ItemCache::new());
        let local = Arc::new(InMemoryLocalCache::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let resolver = Self::resolver_for(&store, &cache, &local, &clock, config);
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            resolver,
            notifier.clone(),
            clock.clone(),
            config,
        );

        Self {
            store,
            clock,
            cache,
            local,
            notifier,
            reconciler: Arc::new(reconciler),
        }
    }

    pub fn resolver_for(
        store: &InMemoryDocumentStore,
        cache: &Arc<ItemCache>,
        local: &Arc<InMemoryLocalCache>,
        clock: &Arc<ManualClock>,
        config: &LedgerConfig,
    ) -> IdentityResolver {
        IdentityResolver::new(
            Arc::new(store.clone()),
            Arc::clone(cache),
            local.clone(),
            clock.clone(),
            config.lookup_timeout,
        )
    }

    pub fn resolver(&self) -> IdentityResolver {
        Self::resolver_for(&self.store, &self.cache, &self.local, &self.clock, &config())
    }

    pub async fn seed(&self, items: Vec<NewItem>) -> Vec<Item> {
        fixtures::seed(&self.store, items).await.unwrap()
    }

    pub fn assert_consistent(&self) {
        assert_projection_consistent(&self.store.items(), &self.store.loans());
    }

    /// Let spawned notification tasks run.
    pub async fn drain_notices(&self, expected: usize) {
        for _ in 0..100 {
            if self.notifier.notices().len() >= expected {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}
