//! Self-monitoring counters for the tailing pipeline
//!
//! Every stage bumps a shared [`PipelineStats`]; the daemon logs a snapshot
//! periodically and on shutdown.

use chrono::{DateTime, Utc};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    /// Lines handed to the chunk accumulator
    pub lines_processed: u64,
    /// Chunks flushed to the publisher
    pub chunks_flushed: u64,
    /// Parsed events pushed to subscribers
    pub events_published: u64,
    /// Analysis or recommendation calls that failed
    pub enrichment_failures: u64,
    pub alerts_sent: u64,
    /// Alerts refused by the debouncer or aborted on a store failure
    pub alerts_suppressed: u64,
    pub timestamp: DateTime<Utc>,
}

/// Lock-free counters shared by all pipeline tasks
#[derive(Debug, Default)]
pub struct PipelineStats {
    lines_processed: AtomicU64,
    chunks_flushed: AtomicU64,
    events_published: AtomicU64,
    enrichment_failures: AtomicU64,
    alerts_sent: AtomicU64,
    alerts_suppressed: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_line(&self) {
        self.lines_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self) {
        self.chunks_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self, count: u64) {
        self.events_published.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_enrichment_failure(&self) {
        self.enrichment_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_sent(&self) {
        self.alerts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_suppressed(&self) {
        self.alerts_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lines_processed: self.lines_processed.load(Ordering::Relaxed),
            chunks_flushed: self.chunks_flushed.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            enrichment_failures: self.enrichment_failures.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alerts_suppressed: self.alerts_suppressed.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        }
    }

    /// Log the current counters at info level
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            "Pipeline stats: {} lines, {} chunks, {} events published, {} enrichment failures, {} alerts sent, {} suppressed",
            snapshot.lines_processed,
            snapshot.chunks_flushed,
            snapshot.events_published,
            snapshot.enrichment_failures,
            snapshot.alerts_sent,
            snapshot.alerts_suppressed
        );
    }
}
