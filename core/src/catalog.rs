//! Identity lookup over an inventory snapshot.
//!
//! [`CatalogIndex`] is built once from a list of items and answers the
//! lookup cascade:
//!
//! 1. exact internal id
//! 2. exact scan code, then stripped scan code
//! 3. exact serial number, then stripped serial number
//! 4. exact display name
//! 5. normalized display name (ties prefer a loaned item, else first found)
//! 6. normalized `brand + model` (same tie-break)
//!
//! [`ItemCache`] holds the current index for one session and is refreshed or
//! invalidated whenever the inventory subscription delivers an update.

use crate::item::{Item, ItemId, ItemStatus};
use crate::normalize::{brand_model_key, normalize_text, strip_code};
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Which cascade step produced a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Internal id
    Id,
    /// Scan code, exact
    ScanCode,
    /// Scan code, whitespace/hyphen-stripped
    ScanCodeStripped,
    /// Serial number, exact
    Serial,
    /// Serial number, whitespace/hyphen-stripped
    SerialStripped,
    /// Display name, exact
    DisplayName,
    /// Display name, normalized
    NormalizedName,
    /// Brand + model, normalized
    NormalizedBrandModel,
}

impl MatchKind {
    /// Returns `true` for the normalized (fuzzy) steps.
    #[must_use]
    pub const fn is_fuzzy(&self) -> bool {
        matches!(self, Self::NormalizedName | Self::NormalizedBrandModel)
    }

    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::ScanCode => "scan_code",
            Self::ScanCodeStripped => "scan_code_stripped",
            Self::Serial => "serial",
            Self::SerialStripped => "serial_stripped",
            Self::DisplayName => "display_name",
            Self::NormalizedName => "normalized_name",
            Self::NormalizedBrandModel => "normalized_brand_model",
        }
    }
}

/// A successful lookup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CatalogMatch<'a> {
    /// The matched item
    pub item: &'a Item,
    /// The step that matched
    pub kind: MatchKind,
    /// How many items shared the matched key (1 for exact steps)
    pub candidates: usize,
}

/// Immutable lookup index over one inventory snapshot.
#[derive(Debug, Default)]
pub struct CatalogIndex {
    items: Vec<Item>,
    by_id: HashMap<String, usize>,
    by_scan_code: HashMap<String, usize>,
    by_scan_code_stripped: HashMap<String, usize>,
    by_serial: HashMap<String, usize>,
    by_serial_stripped: HashMap<String, usize>,
    by_display_name: HashMap<String, usize>,
    by_normalized_name: HashMap<String, Vec<usize>>,
    by_brand_model: HashMap<String, Vec<usize>>,
}

fn index_first(map: &mut HashMap<String, usize>, key: String, position: usize) {
    if !key.is_empty() {
        map.entry(key).or_insert(position);
    }
}

fn index_all(map: &mut HashMap<String, Vec<usize>>, key: String, position: usize) {
    if !key.is_empty() {
        map.entry(key).or_default().push(position);
    }
}

impl CatalogIndex {
    /// Build an index. Item order is preserved and decides "first found".
    #[must_use]
    pub fn build(items: Vec<Item>) -> Self {
        let mut index = Self {
            items,
            ..Self::default()
        };

        for (position, item) in index.items.iter().enumerate() {
            index_first(&mut index.by_id, item.id.as_str().to_string(), position);
            index_first(&mut index.by_scan_code, item.scan_code.trim().to_string(), position);
            index_first(
                &mut index.by_scan_code_stripped,
                strip_code(&item.scan_code),
                position,
            );
            index_first(&mut index.by_serial, item.serial_number.trim().to_string(), position);
            index_first(
                &mut index.by_serial_stripped,
                strip_code(&item.serial_number),
                position,
            );
            index_first(
                &mut index.by_display_name,
                item.display_name.trim().to_string(),
                position,
            );
            index_all(
                &mut index.by_normalized_name,
                normalize_text(&item.display_name),
                position,
            );
            index_all(
                &mut index.by_brand_model,
                brand_model_key(&item.brand, &item.model),
                position,
            );
        }

        index
    }

    /// Run the lookup cascade for a raw reference.
    #[must_use]
    pub fn lookup(&self, raw: &str) -> Option<CatalogMatch<'_>> {
        let reference = raw.trim();
        if reference.is_empty() {
            return None;
        }
        let stripped = strip_code(reference);

        let exact_steps: [(&HashMap<String, usize>, &str, MatchKind); 6] = [
            (&self.by_id, reference, MatchKind::Id),
            (&self.by_scan_code, reference, MatchKind::ScanCode),
            (&self.by_scan_code_stripped, &stripped, MatchKind::ScanCodeStripped),
            (&self.by_serial, reference, MatchKind::Serial),
            (&self.by_serial_stripped, &stripped, MatchKind::SerialStripped),
            (&self.by_display_name, reference, MatchKind::DisplayName),
        ];
        for (map, key, kind) in exact_steps {
            if let Some(&position) = map.get(key) {
                return Some(CatalogMatch {
                    item: &self.items[position],
                    kind,
                    candidates: 1,
                });
            }
        }

        let normalized = normalize_text(reference);
        if normalized.is_empty() {
            return None;
        }
        self.fuzzy(&self.by_normalized_name, &normalized, MatchKind::NormalizedName)
            .or_else(|| {
                self.fuzzy(&self.by_brand_model, &normalized, MatchKind::NormalizedBrandModel)
            })
    }

    fn fuzzy(
        &self,
        map: &HashMap<String, Vec<usize>>,
        key: &str,
        kind: MatchKind,
    ) -> Option<CatalogMatch<'_>> {
        let positions = map.get(key)?;
        let chosen = positions
            .iter()
            .copied()
            .find(|&p| self.items[p].status == ItemStatus::Loaned)
            .or_else(|| positions.first().copied())?;
        Some(CatalogMatch {
            item: &self.items[chosen],
            kind,
            candidates: positions.len(),
        })
    }

    /// Item by internal id.
    #[must_use]
    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.by_id.get(id.as_str()).map(|&p| &self.items[p])
    }

    /// All indexed items, in snapshot order.
    #[must_use]
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Number of indexed items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` when the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    index: Option<Arc<CatalogIndex>>,
    generation: u64,
    fresh: bool,
}

/// Per-session item cache.
///
/// Constructed once and passed by reference to the resolver. Every inventory
/// subscription update must either [`refresh`](Self::refresh) it with the new
/// result set or [`invalidate`](Self::invalidate) it.
#[derive(Debug, Default)]
pub struct ItemCache {
    state: RwLock<CacheState>,
}

impl ItemCache {
    /// Create an empty (cold) cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot and mark it fresh. Returns the new generation.
    pub fn refresh(&self, items: Vec<Item>) -> u64 {
        let index = Arc::new(CatalogIndex::build(items));
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.index = Some(index);
        state.generation += 1;
        state.fresh = true;
        state.generation
    }

    /// Mark the snapshot stale; it remains available as a fallback.
    pub fn invalidate(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.fresh = false;
    }

    /// The current index, only if fresh.
    #[must_use]
    pub fn fresh(&self) -> Option<Arc<CatalogIndex>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.fresh { state.index.clone() } else { None }
    }

    /// The last index seen, fresh or stale.
    #[must_use]
    pub fn last_known(&self) -> Option<Arc<CatalogIndex>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.index.clone()
    }

    /// Number of refreshes so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }
}

/// Key under which the inventory snapshot is persisted in the local cache.
pub const SNAPSHOT_KEY: &str = "equipment-ledger/inventory-snapshot";

/// Serialized inventory snapshot for the local cache collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Items at that time
    pub items: Vec<Item>,
}

/// Snapshot (de)serialization failures.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Encoding failed
    #[error("failed to encode inventory snapshot: {0}")]
    Encode(#[source] bincode::Error),
    /// Decoding failed
    #[error("failed to decode inventory snapshot: {0}")]
    Decode(#[source] bincode::Error),
}

impl InventorySnapshot {
    /// Encode for storage.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serialize(self).map_err(SnapshotError::Encode)
    }

    /// Decode from storage.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Decode`] if the bytes are not a snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        bincode::deserialize(bytes).map_err(SnapshotError::Decode)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::item::{ItemPatch, NewItem};
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn catalog() -> Vec<Item> {
        vec![
            NewItem::named("Laptop Núm. 7")
                .with_brand_model("Lenovo", "T14")
                .with_serial("PF-3K9Q2")
                .with_scan_code("BRC-007")
                .into_item(ItemId::new("item-7"), now()),
            NewItem::named("Chromebook 2")
                .with_brand_model("Acer", "C733")
                .with_serial("NX.H8VAA")
                .with_scan_code("BRC-002")
                .into_item(ItemId::new("item-2"), now()),
            NewItem::named("Carrito")
                .with_brand_model("Dell", "Latitude 3120")
                .into_item(ItemId::new("item-9"), now()),
            NewItem::named("Carrito")
                .with_brand_model("Dell", "Latitude 3120")
                .into_item(ItemId::new("item-10"), now()),
        ]
    }

    fn resolve(index: &CatalogIndex, raw: &str) -> Option<(String, MatchKind)> {
        index
            .lookup(raw)
            .map(|m| (m.item.id.to_string(), m.kind))
    }

    #[test]
    fn cascade_steps_in_order() {
        let index = CatalogIndex::build(catalog());
        assert_eq!(resolve(&index, "item-2"), Some(("item-2".into(), MatchKind::Id)));
        assert_eq!(
            resolve(&index, "BRC-007"),
            Some(("item-7".into(), MatchKind::ScanCode))
        );
        assert_eq!(
            resolve(&index, "brc 007"),
            None,
            "stripping does not fold case"
        );
        assert_eq!(
            resolve(&index, "BRC 007"),
            Some(("item-7".into(), MatchKind::ScanCodeStripped))
        );
        assert_eq!(
            resolve(&index, "PF3K9Q2"),
            Some(("item-7".into(), MatchKind::SerialStripped))
        );
        assert_eq!(
            resolve(&index, "Chromebook 2"),
            Some(("item-2".into(), MatchKind::DisplayName))
        );
        assert_eq!(
            resolve(&index, "LAPTOP NUM 7"),
            Some(("item-7".into(), MatchKind::NormalizedName))
        );
        assert_eq!(
            resolve(&index, "acer c733"),
            Some(("item-2".into(), MatchKind::NormalizedBrandModel))
        );
        assert_eq!(resolve(&index, "projector"), None);
        assert_eq!(resolve(&index, "   "), None);
    }

    #[test]
    fn fuzzy_tie_prefers_loaned_item() {
        let mut items = catalog();
        let index = CatalogIndex::build(items.clone());
        let m = index.lookup("carrito").unwrap();
        assert_eq!(m.item.id.as_str(), "item-9");
        assert_eq!(m.candidates, 2);

        items[3].apply(&ItemPatch::loaned("Aula 201", None, now()));
        let index = CatalogIndex::build(items);
        assert_eq!(index.lookup("CARRITO").unwrap().item.id.as_str(), "item-10");
    }

    #[test]
    fn cache_generations_and_staleness() {
        let cache = ItemCache::new();
        assert!(cache.fresh().is_none());
        assert_eq!(cache.refresh(catalog()), 1);
        assert!(cache.fresh().is_some());

        cache.invalidate();
        assert!(cache.fresh().is_none());
        assert_eq!(cache.last_known().unwrap().len(), 4);
        assert_eq!(cache.refresh(Vec::new()), 2);
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn snapshot_survives_bincode() {
        let snapshot = InventorySnapshot {
            taken_at: now(),
            items: catalog(),
        };
        let bytes = snapshot.to_bytes().unwrap();
        assert_eq!(InventorySnapshot::from_bytes(&bytes).unwrap(), snapshot);
        assert!(InventorySnapshot::from_bytes(&[1, 2, 3]).is_err());
    }

    proptest! {
        #[test]
        fn lookup_is_deterministic(raw in "[A-Za-z0-9 .-]{0,16}") {
            let index = CatalogIndex::build(catalog());
            let first = index.lookup(&raw).map(|m| m.item.id.clone());
            let second = index.lookup(&raw).map(|m| m.item.id.clone());
            prop_assert_eq!(first, second);
        }
    }
}
