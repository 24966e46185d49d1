//! Ledger metrics on the `metrics` facade, plus an optional Prometheus
//! exporter.
//!
//! Counters and histograms are recorded whether or not a recorder is
//! installed. [`describe_metrics`] registers their descriptions; the
//! [`MetricsServer`] installs a Prometheus recorder and calls it.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter serving `/metrics` on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server for `addr` (not yet started).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all ledger metrics and install the exporter.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });
        self.handle = Some(handle);
        describe_metrics();

        tracing::info!(addr = %self.addr, "Metrics exporter started");
        Ok(())
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register descriptions for every ledger metric.
pub fn describe_metrics() {
    describe_counter!("ledger.loans.registered", "Loans recorded in the ledger");
    describe_counter!("ledger.returns.registered", "Returns processed");
    describe_counter!(
        "ledger.returns.anomaly",
        "Returns that found no open ledger row or lost a close race"
    );
    describe_counter!(
        "ledger.projection.pending_sync",
        "Ledger writes whose projection update did not land"
    );
    describe_counter!(
        "ledger.batch.failed_items",
        "Classroom batch references reported as failed"
    );
    describe_counter!(
        "ledger.resolver.cache_fallback",
        "Identity lookups served from a stale or local snapshot"
    );
    describe_counter!("ledger.feed.resubscribed", "Live feed resubscriptions after an error");
    describe_counter!("ledger.sweep.mismatches", "Mismatches reported by the consistency sweep");
    describe_counter!("ledger.sweep.overdue_marked", "Loans flipped to overdue");
    describe_counter!("ledger.retry.success", "Operations that succeeded after a retry");
    describe_counter!("ledger.retry.exhausted", "Operations that exhausted their retries");
    describe_histogram!(
        "ledger.reconcile.duration_seconds",
        "Wall time of a reconciler operation"
    );
}

/// Reconciler metrics recorder.
pub struct ReconcileMetrics;

impl ReconcileMetrics {
    /// A loan was written to the ledger.
    pub fn record_loans(count: usize) {
        counter!("ledger.loans.registered").increment(count as u64);
    }

    /// Returns were processed.
    pub fn record_returns(count: usize) {
        counter!("ledger.returns.registered").increment(count as u64);
    }

    /// A return anomaly was logged.
    pub fn record_anomaly(kind: &'static str) {
        counter!("ledger.returns.anomaly", "kind" => kind).increment(1);
    }

    /// A projection update was left pending.
    pub fn record_pending_sync(operation: &'static str) {
        counter!("ledger.projection.pending_sync", "operation" => operation).increment(1);
    }

    /// Batch references failed.
    pub fn record_batch_failures(count: usize) {
        if count > 0 {
            counter!("ledger.batch.failed_items").increment(count as u64);
        }
    }

    /// Duration of one operation.
    pub fn record_duration(operation: &'static str, duration: Duration) {
        histogram!("ledger.reconcile.duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }
}

/// Resolver metrics recorder.
pub struct ResolverMetrics;

impl ResolverMetrics {
    /// A lookup fell back to a non-live snapshot.
    pub fn record_fallback(source: &'static str) {
        counter!("ledger.resolver.cache_fallback", "source" => source).increment(1);
    }
}

/// Sweep metrics recorder.
pub struct SweepMetrics;

impl SweepMetrics {
    /// Mismatches found by an audit.
    pub fn record_mismatches(count: usize) {
        counter!("ledger.sweep.mismatches").increment(count as u64);
    }

    /// Loans flipped to overdue.
    pub fn record_overdue(count: usize) {
        counter!("ledger.sweep.overdue_marked").increment(count as u64);
    }
}

/// Feed metrics recorder.
pub struct FeedMetrics;

impl FeedMetrics {
    /// A live feed was reopened after an error.
    pub fn record_resubscribe(feed: &'static str) {
        counter!("ledger.feed.resubscribed", "feed" => feed).increment(1);
    }
}
