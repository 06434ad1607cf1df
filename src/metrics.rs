// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - Because if you can't measure it, it didn't happen
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters for every stage of the pipeline. Lock-free because we're
// THAT paranoid about contention, even though half of these are bumped from
// a rayon pool and the other half from a single async task.
//
// A batch run has no business hosting an HTTP endpoint, so instead of
// serving these we snapshot them at the end of the run, serialize to JSON,
// and log the whole thing as the run's closing statement.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Thread-safe atomic metrics collector.
/// Every counter is atomic because mutexes are for the weak.
pub struct PipelineMetrics {
    months_discovered: AtomicU64,
    months_downloaded: AtomicU64,
    months_reused: AtomicU64,
    months_aggregated: AtomicU64,
    months_failed: AtomicU64,
    rows_parsed: AtomicU64,
    rows_with_cnpj_valid: AtomicU64,
    download_failures: AtomicU64,
    insurers_total: AtomicU64,
    insurers_matched_by_cnpj: AtomicU64,
    insurers_matched_by_name: AtomicU64,
    insurers_unmatched: AtomicU64,
    insurers_low_confidence: AtomicU64,
    b2b_skipped: AtomicU64,
    excluded_providers: AtomicU64,
    start_time: Instant,
}

/// The serializable snapshot logged at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub months_discovered: u64,
    pub months_downloaded: u64,
    pub months_reused: u64,
    pub months_aggregated: u64,
    pub months_failed: u64,
    pub rows_parsed: u64,
    pub rows_with_cnpj_valid: u64,
    pub download_failures: u64,
    pub insurers_total: u64,
    pub insurers_matched_by_cnpj: u64,
    pub insurers_matched_by_name: u64,
    pub insurers_unmatched: u64,
    pub insurers_low_confidence: u64,
    pub b2b_skipped: u64,
    pub excluded_providers: u64,
    pub elapsed_seconds: u64,
    pub status: String,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            months_discovered: AtomicU64::new(0),
            months_downloaded: AtomicU64::new(0),
            months_reused: AtomicU64::new(0),
            months_aggregated: AtomicU64::new(0),
            months_failed: AtomicU64::new(0),
            rows_parsed: AtomicU64::new(0),
            rows_with_cnpj_valid: AtomicU64::new(0),
            download_failures: AtomicU64::new(0),
            insurers_total: AtomicU64::new(0),
            insurers_matched_by_cnpj: AtomicU64::new(0),
            insurers_matched_by_name: AtomicU64::new(0),
            insurers_unmatched: AtomicU64::new(0),
            insurers_low_confidence: AtomicU64::new(0),
            b2b_skipped: AtomicU64::new(0),
            excluded_providers: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn set_months_discovered(&self, n: u64) {
        self.months_discovered.store(n, Ordering::Relaxed);
    }

    pub fn incr_months_downloaded(&self) {
        self.months_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_months_reused(&self) {
        self.months_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_months_aggregated(&self) {
        self.months_aggregated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_months_failed(&self) {
        self.months_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows_parsed(&self, n: u64) {
        self.rows_parsed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rows_with_cnpj_valid(&self, n: u64) {
        self.rows_with_cnpj_valid.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_download_failures(&self) {
        self.download_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_insurers_total(&self, n: u64) {
        self.insurers_total.store(n, Ordering::Relaxed);
    }

    pub fn incr_matched_by_cnpj(&self) {
        self.insurers_matched_by_cnpj.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_matched_by_name(&self) {
        self.insurers_matched_by_name.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_unmatched(&self) {
        self.insurers_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_low_confidence(&self) {
        self.insurers_low_confidence.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_b2b_skipped(&self) {
        self.b2b_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_excluded_providers(&self) {
        self.excluded_providers.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters (lock-free reads).
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            months_discovered: self.months_discovered.load(Ordering::Relaxed),
            months_downloaded: self.months_downloaded.load(Ordering::Relaxed),
            months_reused: self.months_reused.load(Ordering::Relaxed),
            months_aggregated: self.months_aggregated.load(Ordering::Relaxed),
            months_failed: self.months_failed.load(Ordering::Relaxed),
            rows_parsed: self.rows_parsed.load(Ordering::Relaxed),
            rows_with_cnpj_valid: self.rows_with_cnpj_valid.load(Ordering::Relaxed),
            download_failures: self.download_failures.load(Ordering::Relaxed),
            insurers_total: self.insurers_total.load(Ordering::Relaxed),
            insurers_matched_by_cnpj: self.insurers_matched_by_cnpj.load(Ordering::Relaxed),
            insurers_matched_by_name: self.insurers_matched_by_name.load(Ordering::Relaxed),
            insurers_unmatched: self.insurers_unmatched.load(Ordering::Relaxed),
            insurers_low_confidence: self.insurers_low_confidence.load(Ordering::Relaxed),
            b2b_skipped: self.b2b_skipped.load(Ordering::Relaxed),
            excluded_providers: self.excluded_providers.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs(),
            status: "completed".to_string(),
        }
    }

    /// Log the closing statement of the run.
    pub fn log_summary(&self) {
        let snap = self.snapshot();
        let json = serde_json::to_string(&snap).unwrap_or_else(|_| "{}".to_string());
        info!(summary = %json, "pipeline run summary");
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = PipelineMetrics::new();
        m.incr_months_downloaded();
        m.incr_months_downloaded();
        m.add_rows_parsed(100);
        m.add_rows_parsed(50);
        let snap = m.snapshot();
        assert_eq!(snap.months_downloaded, 2);
        assert_eq!(snap.rows_parsed, 150);
        assert_eq!(snap.months_failed, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = PipelineMetrics::new();
        m.set_insurers_total(7);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"insurers_total\":7"));
    }
}
