//! A keyboard-wedge scanner as a [`ScanSource`].
//!
//! The console forwards scanned lines into a channel; the source replays them
//! as a scan stream. The channel survives `release`, so the source can be
//! reopened after a session closes.

use equipment_ledger_core::scan::{ScanError, ScanEvent, ScanSource, ScanStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};

/// Scan source fed by console input.
pub struct KeyboardWedge {
    scans: Arc<Mutex<mpsc::Receiver<String>>>,
    open: AtomicBool,
}

impl KeyboardWedge {
    /// Create a source and the sender the console types into.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let wedge = Self {
            scans: Arc::new(Mutex::new(rx)),
            open: AtomicBool::new(false),
        };
        (wedge, tx)
    }

    /// Returns `true` between `open` and `release`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl ScanSource for KeyboardWedge {
    fn open(&self) -> Result<ScanStream, ScanError> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Err(ScanError::Unavailable("scanner already in use".to_string()));
        }
        let scans = Arc::clone(&self.scans);
        Ok(Box::pin(async_stream::stream! {
            loop {
                let next = scans.lock().await.recv().await;
                match next {
                    Some(payload) => yield Ok(ScanEvent::new(payload)),
                    None => {
                        yield Err(ScanError::Stream("console input closed".to_string()));
                        break;
                    },
                }
            }
        }))
    }

    fn release(&self) {
        self.open.store(false, Ordering::Release);
    }
}
