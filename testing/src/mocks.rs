//! Mock collaborators.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use equipment_ledger_core::cache::{CacheFuture, LocalCache};
use equipment_ledger_core::environment::Clock;
use equipment_ledger_core::notify::{LedgerNotice, Notifier, NotifyError, NotifyFuture};
use equipment_ledger_core::scan::{ScanError, ScanEvent, ScanSource, ScanStream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed clock for deterministic tests
///
/// Always returns the same time, making tests reproducible.
///
/// # Example
///
/// ```
/// use equipment_ledger_testing::mocks::FixedClock;
/// use equipment_ledger_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// 2025-03-03 08:00:00 UTC, a school Monday morning.
#[must_use]
pub fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_740_988_800, 0).unwrap_or_default()
}

/// A fixed clock at [`base_time`].
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(base_time())
}

/// A clock tests can move forward.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `start`.
    #[must_use]
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: ChronoDuration) {
        let mut now = locked(&self.now);
        *now += by;
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *locked(&self.now) = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(base_time())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *locked(&self.now)
    }
}

/// Captures notices; can be told to fail or stall.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<LedgerNotice>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingNotifier {
    /// A notifier that records and succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail (after recording).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall every delivery by `delay` before recording.
    pub fn set_delay(&self, delay: Duration) {
        *locked(&self.delay) = Some(delay);
    }

    /// Notices delivered so far.
    #[must_use]
    pub fn notices(&self) -> Vec<LedgerNotice> {
        locked(&self.notices).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: LedgerNotice) -> NotifyFuture<'_> {
        Box::pin(async move {
            let delay = *locked(&self.delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            locked(&self.notices).push(notice);
            if self.failing.load(Ordering::SeqCst) {
                return Err(NotifyError("mail relay refused".to_string()));
            }
            Ok(())
        })
    }
}

/// Key-value cache in memory.
#[derive(Debug, Default)]
pub struct InMemoryLocalCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryLocalCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` holds a value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        locked(&self.entries).contains_key(key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        locked(&self.entries).clear();
    }
}

impl LocalCache for InMemoryLocalCache {
    fn get(&self, key: &str) -> CacheFuture<'_, Option<Vec<u8>>> {
        let value = locked(&self.entries).get(key).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn set(&self, key: &str, value: Vec<u8>) -> CacheFuture<'_, ()> {
        locked(&self.entries).insert(key.to_string(), value);
        Box::pin(async { Ok(()) })
    }
}

/// Scan source fed from the test; tracks device acquisition.
#[derive(Debug, Default)]
pub struct ChannelScanSource {
    sender: Mutex<Option<mpsc::UnboundedSender<Result<ScanEvent, ScanError>>>>,
    opened: AtomicUsize,
    released: AtomicUsize,
    held: AtomicBool,
    refuse_open: AtomicBool,
}

impl ChannelScanSource {
    /// A source with no device acquired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` calls fail.
    pub fn set_refuse_open(&self, refuse: bool) {
        self.refuse_open.store(refuse, Ordering::SeqCst);
    }

    /// Emit a decoded payload. Returns `false` if the device is not open.
    pub fn scan(&self, payload: &str) -> bool {
        locked(&self.sender)
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(ScanEvent::new(payload))).is_ok())
    }

    /// Emit a hardware error.
    pub fn fail(&self, reason: &str) -> bool {
        locked(&self.sender)
            .as_ref()
            .is_some_and(|tx| tx.send(Err(ScanError::Stream(reason.to_string()))).is_ok())
    }

    /// Times `open` succeeded.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Times the device was released while held.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Returns `true` while the device is acquired.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl ScanSource for ChannelScanSource {
    fn open(&self) -> Result<ScanStream, ScanError> {
        if self.refuse_open.load(Ordering::SeqCst) {
            return Err(ScanError::Unavailable("camera busy".to_string()));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        *locked(&self.sender) = Some(tx);
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.held.store(true, Ordering::SeqCst);

        Ok(Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }))
    }

    fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        locked(&self.sender).take();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn fixed_clock_is_stable() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::default();
        clock.advance(ChronoDuration::hours(2));
        assert_eq!(clock.now(), base_time() + ChronoDuration::hours(2));
    }

    #[tokio::test]
    async fn scan_source_tracks_acquisition() {
        let source = ChannelScanSource::new();
        let mut stream = source.open().unwrap();
        assert!(source.is_held());
        assert!(source.scan("QR-1"));
        assert_eq!(stream.next().await.unwrap().unwrap().payload, "QR-1");

        source.release();
        source.release();
        assert!(!source.is_held());
        assert_eq!(source.release_count(), 1);
        assert!(stream.next().await.is_none());
    }
}
