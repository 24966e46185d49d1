//! Inventory items: the mutable current-state projection.
//!
//! There is exactly one [`Item`] record per physical piece of equipment. The
//! record is created by inventory management and afterwards mutated only by
//! the reconciler, through [`ItemPatch`] values.
//!
//! # Invariant
//!
//! `status = loaned ⟺ current_holder ≠ null`. [`Item::is_consistent`] checks
//! it; [`ItemPatch::loaned`] and [`ItemPatch::available`] always preserve it.

use crate::normalize::strip_code;
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned, immutable identifier of an inventory item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Create a new `ItemId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the item ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `ItemId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Current availability of an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// In the pool, free to lend
    Available,
    /// Out with a borrower
    Loaned,
    /// Pulled for servicing
    Maintenance,
    /// Reported damaged
    Damaged,
}

impl ItemStatus {
    /// Database/document string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Loaned => "loaned",
            Self::Maintenance => "maintenance",
            Self::Damaged => "damaged",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Projection record: current status, location and holder of one item.
///
/// Required fields: `id`, `displayName`, `status`, `createdAt`, `updatedAt`.
/// Everything else defaults when absent from the stored document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Store-assigned identifier
    pub id: ItemId,
    /// Operator-facing name, e.g. "Laptop Núm. 7"
    pub display_name: String,
    /// Manufacturer
    #[serde(default)]
    pub brand: String,
    /// Model name
    #[serde(default)]
    pub model: String,
    /// Manufacturer serial number
    #[serde(default)]
    pub serial_number: String,
    /// Barcode/QR payload printed on the asset tag
    #[serde(default)]
    pub scan_code: String,
    /// Current availability
    pub status: ItemStatus,
    /// Borrower key (email or classroom label) while loaned
    #[serde(default)]
    pub current_holder: Option<String>,
    /// Free-text location
    #[serde(default)]
    pub location: Option<String>,
    /// When the item last went out
    #[serde(default)]
    pub last_loan_at: Option<DateTime<Utc>>,
    /// When the item last came back
    #[serde(default)]
    pub last_return_at: Option<DateTime<Utc>>,
    /// Historical reference strings: seed ids, former tags, former names.
    ///
    /// Old ledger rows may have been written under any of these.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// `status = loaned ⟺ current_holder ≠ null`
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        (self.status == ItemStatus::Loaned) == self.current_holder.is_some()
    }

    /// Label for display, falling back to the raw id.
    #[must_use]
    pub fn display_label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.display_name
        }
    }

    /// Every string a ledger row may have used to reference this item.
    ///
    /// Includes the id, scan code and serial number (raw and stripped), the
    /// display name, and all aliases. Empty values are skipped and the result
    /// holds no duplicates.
    #[must_use]
    pub fn reference_strings(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::with_capacity(8 + self.aliases.len());
        let mut push = |value: &str| {
            let value = value.trim();
            if !value.is_empty() && !refs.iter().any(|r| r == value) {
                refs.push(value.to_string());
            }
        };

        push(self.id.as_str());
        push(&self.scan_code);
        push(&strip_code(&self.scan_code));
        push(&self.serial_number);
        push(&strip_code(&self.serial_number));
        push(&self.display_name);
        for alias in &self.aliases {
            push(alias);
            push(&strip_code(alias));
        }

        refs
    }

    /// Apply a projection patch in place.
    pub fn apply(&mut self, patch: &ItemPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(holder) = &patch.current_holder {
            self.current_holder.clone_from(holder);
        }
        if let Some(location) = &patch.location {
            self.location.clone_from(location);
        }
        if let Some(at) = patch.last_loan_at {
            self.last_loan_at = Some(at);
        }
        if let Some(at) = patch.last_return_at {
            self.last_return_at = Some(at);
        }
        self.updated_at = patch.updated_at;
    }

    /// Copy of this item with `patch` applied.
    #[must_use]
    pub fn patched(&self, patch: &ItemPatch) -> Self {
        let mut item = self.clone();
        item.apply(patch);
        item
    }
}

/// Fields needed to register a new item (inventory management).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct NewItem {
    /// Operator-facing name
    pub display_name: String,
    /// Manufacturer
    pub brand: String,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial_number: String,
    /// Barcode/QR payload
    pub scan_code: String,
    /// Initial location
    pub location: Option<String>,
    /// Historical reference strings
    pub aliases: Vec<String>,
}

impl NewItem {
    /// Start a new item with only a display name.
    #[must_use]
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Set brand and model.
    #[must_use]
    pub fn with_brand_model(mut self, brand: impl Into<String>, model: impl Into<String>) -> Self {
        self.brand = brand.into();
        self.model = model.into();
        self
    }

    /// Set the serial number.
    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = serial.into();
        self
    }

    /// Set the barcode/QR payload.
    #[must_use]
    pub fn with_scan_code(mut self, code: impl Into<String>) -> Self {
        self.scan_code = code.into();
        self
    }

    /// Add a historical reference string.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Materialize into an available [`Item`] with the given id.
    #[must_use]
    pub fn into_item(self, id: ItemId, now: DateTime<Utc>) -> Item {
        Item {
            id,
            display_name: self.display_name,
            brand: self.brand,
            model: self.model,
            serial_number: self.serial_number,
            scan_code: self.scan_code,
            status: ItemStatus::Available,
            current_holder: None,
            location: self.location,
            last_loan_at: None,
            last_return_at: None,
            aliases: self.aliases,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A partial update of an [`Item`] projection.
///
/// `None` leaves a field untouched. For nullable fields the inner `Option`
/// is the new value, so `Some(None)` clears it.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemPatch {
    /// New status
    pub status: Option<ItemStatus>,
    /// New holder (`Some(None)` clears)
    pub current_holder: Option<Option<String>>,
    /// New location (`Some(None)` clears)
    pub location: Option<Option<String>>,
    /// New last-loan timestamp
    pub last_loan_at: Option<DateTime<Utc>>,
    /// New last-return timestamp
    pub last_return_at: Option<DateTime<Utc>>,
    /// Modification timestamp (always written)
    pub updated_at: DateTime<Utc>,
}

impl ItemPatch {
    /// Patch marking an item as out with `holder`.
    #[must_use]
    pub fn loaned(holder: impl Into<String>, location: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(ItemStatus::Loaned),
            current_holder: Some(Some(holder.into())),
            location: Some(location),
            last_loan_at: Some(at),
            last_return_at: None,
            updated_at: at,
        }
    }

    /// Patch returning an item to the pool.
    #[must_use]
    pub const fn available(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(ItemStatus::Available),
            current_holder: Some(None),
            location: Some(None),
            last_loan_at: None,
            last_return_at: Some(at),
            updated_at: at,
        }
    }

    /// Document fields written by this patch (camelCase keys, explicit nulls).
    #[must_use]
    pub fn to_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        use serde_json::Value;

        let mut fields = serde_json::Map::new();
        if let Some(status) = self.status {
            fields.insert("status".into(), Value::String(status.as_str().into()));
        }
        if let Some(holder) = &self.current_holder {
            fields.insert(
                "currentHolder".into(),
                holder.clone().map_or(Value::Null, Value::String),
            );
        }
        if let Some(location) = &self.location {
            fields.insert(
                "location".into(),
                location.clone().map_or(Value::Null, Value::String),
            );
        }
        if let Some(at) = self.last_loan_at {
            fields.insert("lastLoanAt".into(), Value::String(at.to_rfc3339()));
        }
        if let Some(at) = self.last_return_at {
            fields.insert("lastReturnAt".into(), Value::String(at.to_rfc3339()));
        }
        fields.insert(
            "updatedAt".into(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        fields
    }
}

/// A multi-item projection write, committed all-or-nothing by the store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProjectionBatch {
    updates: Vec<(ItemId, ItemPatch)>,
}

impl ProjectionBatch {
    /// Create an empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            updates: Vec::new(),
        }
    }

    /// Queue an update.
    pub fn push(&mut self, id: ItemId, patch: ItemPatch) {
        self.updates.push((id, patch));
    }

    /// Number of queued updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// `true` when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Iterate over queued updates.
    pub fn iter(&self) -> impl Iterator<Item = &(ItemId, ItemPatch)> {
        self.updates.iter()
    }

    /// Consume the batch.
    #[must_use]
    pub fn into_updates(self) -> Vec<(ItemId, ItemPatch)> {
        self.updates
    }
}
