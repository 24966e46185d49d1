//! Scan input collaborator.
//!
//! A source produces a lazy, non-terminating, restartable stream of decoded
//! payloads. Bursts of duplicate payloads for one physical code are normal.
//! The hardware resource behind a source is held from [`ScanSource::open`]
//! until [`ScanSource::release`].

use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// One decoded scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanEvent {
    /// Decoded barcode/QR payload
    pub payload: String,
}

impl ScanEvent {
    /// Build an event from a payload.
    #[must_use]
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Scan hardware failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The device could not be opened (busy, permission denied)
    #[error("scan device unavailable: {0}")]
    Unavailable(String),
    /// The decode stream broke
    #[error("scan stream failed: {0}")]
    Stream(String),
}

/// Stream of scans; an `Err` item means the hardware stream failed.
pub type ScanStream = Pin<Box<dyn Stream<Item = Result<ScanEvent, ScanError>> + Send>>;

/// Camera/barcode hardware.
pub trait ScanSource: Send + Sync {
    /// Acquire the device and start decoding.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Unavailable`] if the device cannot be acquired.
    fn open(&self) -> Result<ScanStream, ScanError>;

    /// Release the device. Must be safe to call more than once.
    fn release(&self);
}
