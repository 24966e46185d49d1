//! Identity resolution: raw reference → canonical item.
//!
//! The resolver runs the [`CatalogIndex`] cascade against the best snapshot
//! it can get:
//!
//! 1. the session [`ItemCache`], if fresh
//! 2. a live `list()` bounded by `lookup_timeout` (refreshes the cache and
//!    persists a snapshot to the [`LocalCache`])
//! 3. on a transient failure, the last in-memory snapshot, then the
//!    persisted local snapshot
//!
//! Only the lookup may use a cached snapshot; writes always go to the live
//! store. The resolver never creates items.

use crate::metrics::ResolverMetrics;
use equipment_ledger_core::cache::LocalCache;
use equipment_ledger_core::catalog::{
    CatalogIndex, InventorySnapshot, ItemCache, MatchKind, SNAPSHOT_KEY,
};
use equipment_ledger_core::environment::Clock;
use equipment_ledger_core::error::StoreError;
use equipment_ledger_core::item::Item;
use equipment_ledger_core::store::InventoryStore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No cascade step matched
    #[error("no item matches reference `{0}`")]
    NotFound(String),

    /// The reference was blank
    #[error("empty item reference")]
    EmptyReference,

    /// The live read failed and no snapshot is available
    #[error("inventory unavailable: {0}")]
    Store(#[source] StoreError),
}

/// Where the snapshot used for a lookup came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Fresh session cache
    Cache,
    /// Live read
    Live,
    /// Stale session cache (live read failed)
    StaleCache,
    /// Persisted local snapshot (live read failed, session cache cold)
    LocalCache,
}

impl SnapshotSource {
    /// Returns `true` if the lookup used a fallback snapshot.
    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        matches!(self, Self::StaleCache | Self::LocalCache)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Live => "live",
            Self::StaleCache => "stale_cache",
            Self::LocalCache => "local_cache",
        }
    }
}

/// A resolved reference.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    /// The canonical item as of the snapshot
    pub item: Item,
    /// Which cascade step matched
    pub kind: MatchKind,
    /// Items sharing the matched key
    pub candidates: usize,
    /// Snapshot origin
    pub source: SnapshotSource,
}

/// A snapshot with its origin.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// The lookup index
    pub index: Arc<CatalogIndex>,
    /// Where it came from
    pub source: SnapshotSource,
}

impl Snapshot {
    /// Resolve one reference against this snapshot.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::EmptyReference`] for a blank reference
    /// - [`ResolveError::NotFound`] if no cascade step matches
    pub fn resolve(&self, raw: &str) -> Result<Resolution, ResolveError> {
        if raw.trim().is_empty() {
            return Err(ResolveError::EmptyReference);
        }
        let found = self
            .index
            .lookup(raw)
            .ok_or_else(|| ResolveError::NotFound(raw.trim().to_string()))?;

        if found.kind.is_fuzzy() && found.candidates > 1 {
            tracing::warn!(
                reference = raw,
                item_id = %found.item.id,
                candidates = found.candidates,
                kind = found.kind.as_str(),
                "Ambiguous fuzzy match resolved by tie-break"
            );
        }

        Ok(Resolution {
            item: found.item.clone(),
            kind: found.kind,
            candidates: found.candidates,
            source: self.source,
        })
    }
}

/// Resolves ambiguous item references to canonical items.
#[derive(Clone)]
pub struct IdentityResolver {
    inventory: Arc<dyn InventoryStore>,
    cache: Arc<ItemCache>,
    local: Arc<dyn LocalCache>,
    clock: Arc<dyn Clock>,
    lookup_timeout: Duration,
}

impl IdentityResolver {
    /// Create a resolver over `inventory` using the session `cache`.
    #[must_use]
    pub fn new(
        inventory: Arc<dyn InventoryStore>,
        cache: Arc<ItemCache>,
        local: Arc<dyn LocalCache>,
        clock: Arc<dyn Clock>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            inventory,
            cache,
            local,
            clock,
            lookup_timeout,
        }
    }

    /// The session cache this resolver reads.
    #[must_use]
    pub fn cache(&self) -> &Arc<ItemCache> {
        &self.cache
    }

    /// Resolve one raw reference.
    ///
    /// # Errors
    ///
    /// See [`Snapshot::resolve`]; additionally [`ResolveError::Store`] when no
    /// snapshot can be obtained.
    pub async fn resolve(&self, raw: &str) -> Result<Resolution, ResolveError> {
        if raw.trim().is_empty() {
            return Err(ResolveError::EmptyReference);
        }
        self.snapshot().await?.resolve(raw)
    }

    /// Resolve several references against one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Store`] when no snapshot can be obtained;
    /// per-reference failures are returned in the vector.
    pub async fn resolve_many(
        &self,
        refs: &[String],
    ) -> Result<Vec<Result<Resolution, ResolveError>>, ResolveError> {
        let snapshot = self.snapshot().await?;
        Ok(refs.iter().map(|r| snapshot.resolve(r)).collect())
    }

    /// Get the best available snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Store`] if the live read fails and neither an
    /// in-memory nor a persisted snapshot exists, or if the live read fails
    /// with a non-transient error.
    pub async fn snapshot(&self) -> Result<Snapshot, ResolveError> {
        if let Some(index) = self.cache.fresh() {
            return Ok(Snapshot {
                index,
                source: SnapshotSource::Cache,
            });
        }

        let error = match self.refresh().await {
            Ok(index) => {
                return Ok(Snapshot {
                    index,
                    source: SnapshotSource::Live,
                });
            },
            Err(error) if error.is_transient() => error,
            Err(error) => return Err(ResolveError::Store(error)),
        };

        if let Some(index) = self.cache.last_known() {
            return Ok(self.fallback(index, SnapshotSource::StaleCache, &error));
        }

        match self.load_local().await {
            Some(index) => Ok(self.fallback(index, SnapshotSource::LocalCache, &error)),
            None => Err(ResolveError::Store(error)),
        }
    }

    /// Force a live read, refresh the session cache and persist a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if the read exceeds `lookup_timeout`,
    /// or the store's error.
    pub async fn refresh(&self) -> Result<Arc<CatalogIndex>, StoreError> {
        let items = tokio::time::timeout(self.lookup_timeout, self.inventory.list())
            .await
            .map_err(|_| StoreError::Timeout(self.lookup_timeout))??;

        self.persist(&items).await;
        self.cache.refresh(items);
        self.cache
            .last_known()
            .ok_or_else(|| StoreError::Unavailable("item cache empty after refresh".into()))
    }

    fn fallback(&self, index: Arc<CatalogIndex>, source: SnapshotSource, error: &StoreError) -> Snapshot {
        ResolverMetrics::record_fallback(source.as_str());
        tracing::warn!(
            source = source.as_str(),
            items = index.len(),
            generation = self.cache.generation(),
            error = %error,
            "Live inventory read failed, resolving against cached snapshot"
        );
        Snapshot { index, source }
    }

    async fn persist(&self, items: &[Item]) {
        let snapshot = InventorySnapshot {
            taken_at: self.clock.now(),
            items: items.to_vec(),
        };
        let bytes = match snapshot.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode inventory snapshot");
                return;
            },
        };
        match tokio::time::timeout(self.lookup_timeout, self.local.set(SNAPSHOT_KEY, bytes)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => tracing::debug!(error = %e, "Local snapshot not persisted"),
            Err(_) => tracing::warn!(
                timeout_ms = self.lookup_timeout.as_millis(),
                "Local cache did not answer, snapshot not persisted"
            ),
        }
    }

    async fn load_local(&self) -> Option<Arc<CatalogIndex>> {
        let bytes = match tokio::time::timeout(self.lookup_timeout, self.local.get(SNAPSHOT_KEY)).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Local snapshot unavailable");
                return None;
            },
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.lookup_timeout.as_millis(),
                    "Local cache did not answer, no snapshot loaded"
                );
                return None;
            },
        };
        match InventorySnapshot::from_bytes(&bytes) {
            Ok(snapshot) => {
                tracing::debug!(taken_at = %snapshot.taken_at, "Loaded local inventory snapshot");
                Some(Arc::new(CatalogIndex::build(snapshot.items)))
            },
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable local snapshot");
                None
            },
        }
    }
}
