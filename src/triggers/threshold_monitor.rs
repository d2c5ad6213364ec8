//! Periodic error-volume check
//!
//! Every cycle the monitor counts recent error events per (server, problem)
//! and alerts the server owner about every bucket above the server's threshold,
//! at most once per cooldown window.

use crate::alerts::{AlertDispatcher, KeywordDebouncer};
use crate::error::StoreError;
use crate::events::{ParsedEvent, ThresholdKey};
use crate::monitoring::PipelineStats;
use crate::storage::{EventStore, ServerDirectory};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of one evaluation cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThresholdReport {
    /// Distinct (server, problem) buckets seen
    pub buckets: usize,
    /// Buckets strictly above their server's threshold
    pub exceeded: usize,
    pub notified: usize,
    /// Refused by the debouncer
    pub suppressed: usize,
    /// Skipped because the server, the store or the mailer failed
    pub failed: usize,
    /// Records the store dropped as older than the window
    pub pruned: usize,
}

/// Count error events with a server id per threshold bucket
pub fn count_errors(events: &[ParsedEvent]) -> BTreeMap<ThresholdKey, usize> {
    let mut counts = BTreeMap::new();
    for event in events.iter().filter(|event| event.is_error()) {
        let Some(server_id) = event.server_id else {
            continue;
        };
        let key = ThresholdKey {
            server_id,
            problem: event.problem.clone(),
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

/// Whether `count` errors break a threshold; no threshold never alerts
pub fn exceeds(count: usize, threshold: Option<u32>) -> bool {
    threshold.is_some_and(|threshold| count > threshold as usize)
}

/// Evaluates error thresholds on a fixed period
pub struct ThresholdMonitor {
    store: Arc<dyn EventStore>,
    directory: Arc<dyn ServerDirectory>,
    debouncer: Arc<KeywordDebouncer>,
    dispatcher: Arc<AlertDispatcher>,
    stats: Arc<PipelineStats>,
    window: chrono::Duration,
    interval: Duration,
}

impl ThresholdMonitor {
    /// Create a monitor with a 24 hour window evaluated every hour
    pub fn new(
        store: Arc<dyn EventStore>,
        directory: Arc<dyn ServerDirectory>,
        debouncer: Arc<KeywordDebouncer>,
        dispatcher: Arc<AlertDispatcher>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            directory,
            debouncer,
            dispatcher,
            stats,
            window: chrono::Duration::hours(24),
            interval: Duration::from_secs(3600),
        }
    }

    pub fn with_window(mut self, window: chrono::Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one evaluation cycle
    ///
    /// # Errors
    ///
    /// Returns `StoreError` only when recent events cannot be queried; failures
    /// for individual buckets are counted in the report.
    pub async fn run_once(&self) -> Result<ThresholdReport, StoreError> {
        let since = Utc::now() - self.window;
        let events = self.store.recent_errors(since).await?;
        let counts = count_errors(&events);
        let mut report = ThresholdReport {
            buckets: counts.len(),
            ..Default::default()
        };

        match self.store.prune(since).await {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => warn!("Failed to prune records older than the window: {}", e),
        }

        for (key, count) in counts {
            let Some(server) = self.directory.server(key.server_id) else {
                warn!("Errors recorded for unknown server {}", key.server_id);
                report.failed += 1;
                continue;
            };
            if !exceeds(count, server.error_threshold) {
                continue;
            }
            report.exceeded += 1;
            // exceeds() returned true, so a threshold is set
            let threshold = server.error_threshold.unwrap_or_default();

            match self
                .debouncer
                .should_notify_for(key.server_id, &key.subject(), &server.recipient)
                .await
            {
                Ok(true) => {
                    info!(
                        "Error threshold reached for {}: {} > {}",
                        key, count, threshold
                    );
                    match self
                        .dispatcher
                        .threshold_reached(&key, count, threshold, &server.recipient)
                        .await
                    {
                        Ok(()) => report.notified += 1,
                        Err(e) => {
                            warn!("Threshold alert for {} not delivered: {}", key, e);
                            report.failed += 1;
                        }
                    }
                }
                Ok(false) => {
                    self.stats.record_alert_suppressed();
                    info!("Threshold alert for {} suppressed (cooldown active)", key);
                    report.suppressed += 1;
                }
                Err(e) => {
                    self.stats.record_alert_suppressed();
                    warn!(
                        "Silence store unavailable, skipping threshold alert for {}: {}",
                        key, e
                    );
                    report.failed += 1;
                }
            }
        }

        debug!("Threshold cycle: {:?}", report);
        Ok(report)
    }

    /// Evaluate immediately, then every interval until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Threshold monitor started (every {:?}, window {}h)",
            self.interval,
            self.window.num_hours()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Threshold evaluation failed: {}", e);
                    }
                }
            }
        }
        info!("Threshold monitor stopped");
    }
}
