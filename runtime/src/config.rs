//! Runtime configuration loaded from environment variables.
//!
//! Every value has a default; unparsable values fall back to it.

use crate::retry::RetryPolicy;
use std::env;
use std::time::Duration;

/// Tunables for the resolver, reconciler, scan sessions and live feeds.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    /// Bound on the live inventory read used for identity lookup
    pub lookup_timeout: Duration,
    /// Bound on each ledger/projection write
    pub write_timeout: Duration,
    /// Concurrent ledger writes in a classroom batch
    pub batch_concurrency: usize,
    /// Backoff for projection writes after a successful ledger write
    pub projection_retry: RetryPolicy,
    /// Hard timeout of a scan session
    pub session_timeout: Duration,
    /// Debounce window after a cancelled session
    pub scan_cooldown: Duration,
    /// Bound on one notification delivery
    pub notify_timeout: Duration,
    /// Backoff for resubscribing live feeds
    pub feed_retry: RetryPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_millis(3000),
            write_timeout: Duration::from_millis(8000),
            batch_concurrency: 4,
            projection_retry: RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(200))
                .build(),
            session_timeout: Duration::from_secs(120),
            scan_cooldown: Duration::from_millis(1500),
            notify_timeout: Duration::from_millis(2000),
            feed_retry: RetryPolicy::builder()
                .max_retries(usize::MAX)
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(30))
                .jitter(true)
                .build(),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn millis(key: &str, default: Duration) -> Duration {
    parsed(key).map_or(default, Duration::from_millis)
}

impl LedgerConfig {
    /// Load configuration from `LEDGER_*` environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `LEDGER_LOOKUP_TIMEOUT_MS` | 3000 |
    /// | `LEDGER_WRITE_TIMEOUT_MS` | 8000 |
    /// | `LEDGER_BATCH_CONCURRENCY` | 4 |
    /// | `LEDGER_PROJECTION_RETRIES` | 2 |
    /// | `LEDGER_SESSION_TIMEOUT_SECS` | 120 |
    /// | `LEDGER_SCAN_COOLDOWN_MS` | 1500 |
    /// | `LEDGER_NOTIFY_TIMEOUT_MS` | 2000 |
    /// | `LEDGER_FEED_RETRY_INITIAL_MS` | 500 |
    /// | `LEDGER_FEED_RETRY_MAX_MS` | 30000 |
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            lookup_timeout: millis("LEDGER_LOOKUP_TIMEOUT_MS", defaults.lookup_timeout),
            write_timeout: millis("LEDGER_WRITE_TIMEOUT_MS", defaults.write_timeout),
            batch_concurrency: parsed::<usize>("LEDGER_BATCH_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_concurrency),
            projection_retry: RetryPolicy {
                max_retries: parsed("LEDGER_PROJECTION_RETRIES")
                    .unwrap_or(defaults.projection_retry.max_retries),
                ..defaults.projection_retry
            },
            session_timeout: parsed("LEDGER_SESSION_TIMEOUT_SECS")
                .map_or(defaults.session_timeout, Duration::from_secs),
            scan_cooldown: millis("LEDGER_SCAN_COOLDOWN_MS", defaults.scan_cooldown),
            notify_timeout: millis("LEDGER_NOTIFY_TIMEOUT_MS", defaults.notify_timeout),
            feed_retry: RetryPolicy {
                initial_delay: millis("LEDGER_FEED_RETRY_INITIAL_MS", defaults.feed_retry.initial_delay),
                max_delay: millis("LEDGER_FEED_RETRY_MAX_MS", defaults.feed_retry.max_delay),
                ..defaults.feed_retry
            },
        }
    }
}
