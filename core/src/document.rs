//! Decoding of raw store documents at the adapter boundary.
//!
//! Store adapters hold records as JSON objects. Before anything reaches the
//! resolver or reconciler it passes through [`decode`], which rejects
//! documents that are not objects, lack a required field, or carry a value
//! of the wrong shape.

use crate::item::Item;
use crate::loan::LoanEvent;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// A raw document as held by the backing store.
pub type Document = serde_json::Map<String, Value>;

/// A record family stored as documents in one collection.
pub trait Record: Serialize + DeserializeOwned {
    /// Collection name
    const COLLECTION: &'static str;

    /// Fields that must be present and non-null.
    ///
    /// `id` is always injected from the document key and need not be listed.
    const REQUIRED: &'static [&'static str];
}

impl Record for Item {
    const COLLECTION: &'static str = "inventory";
    const REQUIRED: &'static [&'static str] = &["displayName", "status", "createdAt", "updatedAt"];
}

impl Record for LoanEvent {
    const COLLECTION: &'static str = "loans";
    const REQUIRED: &'static [&'static str] = &[
        "itemRef",
        "borrowerKey",
        "loanedAt",
        "status",
        "createdAt",
        "updatedAt",
    ];
}

/// Errors raised when a stored document cannot become a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// The document is not a JSON object
    #[error("{collection}/{id}: document is not an object")]
    NotAnObject {
        /// Collection name
        collection: &'static str,
        /// Document id
        id: String,
    },

    /// A required field is absent or null
    #[error("{collection}/{id}: missing required field `{field}`")]
    MissingField {
        /// Collection name
        collection: &'static str,
        /// Document id
        id: String,
        /// Field name
        field: &'static str,
    },

    /// A field carries a value of the wrong shape
    #[error("{collection}/{id}: invalid document: {reason}")]
    Invalid {
        /// Collection name
        collection: &'static str,
        /// Document id
        id: String,
        /// Deserializer message
        reason: String,
    },
}

/// Decode the document stored under `id` into a record.
///
/// # Errors
///
/// Returns [`DocumentError`] if the document is not an object, misses a
/// required field, or fails to deserialize.
pub fn decode<R: Record>(id: &str, value: Value) -> Result<R, DocumentError> {
    let Value::Object(mut doc) = value else {
        return Err(DocumentError::NotAnObject {
            collection: R::COLLECTION,
            id: id.to_string(),
        });
    };

    for &field in R::REQUIRED {
        if doc.get(field).is_none_or(Value::is_null) {
            return Err(DocumentError::MissingField {
                collection: R::COLLECTION,
                id: id.to_string(),
                field,
            });
        }
    }

    doc.insert("id".to_string(), Value::String(id.to_string()));

    serde_json::from_value(Value::Object(doc)).map_err(|e| DocumentError::Invalid {
        collection: R::COLLECTION,
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Encode a record into its stored document form (without the `id` key).
///
/// # Errors
///
/// Returns [`DocumentError::Invalid`] if serialization fails, or
/// [`DocumentError::NotAnObject`] if the record does not encode to an object.
pub fn encode<R: Record>(id: &str, record: &R) -> Result<Document, DocumentError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(mut doc)) => {
            doc.remove("id");
            Ok(doc)
        },
        Ok(_) => Err(DocumentError::NotAnObject {
            collection: R::COLLECTION,
            id: id.to_string(),
        }),
        Err(e) => Err(DocumentError::Invalid {
            collection: R::COLLECTION,
            id: id.to_string(),
            reason: e.to_string(),
        }),
    }
}
