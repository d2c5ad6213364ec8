//! Assembly of the tailing pipeline
//!
//! [`Pipeline`] connects the supervisor, the accumulator, the publisher and the
//! threshold monitor around externally supplied collaborators, and owns the
//! background tasks.

use crate::aggregator::ChunkAccumulator;
use crate::alerts::{AlertDispatcher, ExpiringStore, KeywordDebouncer, Mailer};
use crate::analysis::{AnalysisBackend, ChunkPublisher, PushTransport, RecommendationBackend};
use crate::collectors::TailSupervisor;
use crate::config::Config;
use crate::monitoring::PipelineStats;
use crate::storage::{EventStore, ServerDirectory};
use crate::triggers::ThresholdMonitor;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Retry ticks between two stats summaries
const STATS_LOG_EVERY_TICKS: u64 = 12;

/// External collaborators the pipeline runs against
pub struct PipelineParts {
    pub directory: Arc<dyn ServerDirectory>,
    pub store: Arc<dyn EventStore>,
    pub silence_store: Arc<dyn ExpiringStore>,
    pub mailer: Arc<dyn Mailer>,
    pub analysis: Arc<dyn AnalysisBackend>,
    pub recommendations: Arc<dyn RecommendationBackend>,
    pub transport: Arc<dyn PushTransport>,
}

/// The running components and their shared state
pub struct Pipeline {
    config: Config,
    directory: Arc<dyn ServerDirectory>,
    pub stats: Arc<PipelineStats>,
    pub accumulator: Arc<ChunkAccumulator>,
    pub publisher: Arc<ChunkPublisher>,
    pub supervisor: Arc<TailSupervisor>,
    pub monitor: Arc<ThresholdMonitor>,
    root: CancellationToken,
}

impl Pipeline {
    /// Build every component from the configuration and the collaborators
    ///
    /// Cancelling `root` stops all followers and background tasks.
    pub fn new(config: Config, parts: PipelineParts, root: CancellationToken) -> Self {
        let stats = Arc::new(PipelineStats::new());

        let mut debouncer = KeywordDebouncer::new(parts.silence_store, config.cooldown())
            .with_timeout(Duration::from_secs(config.alerts.store_timeout_seconds));
        for server in &config.servers {
            if let Some(minutes) = server.cooldown_minutes {
                debouncer = debouncer.with_override(server.id, Duration::from_secs(minutes * 60));
            }
        }
        let debouncer = Arc::new(debouncer);

        let mail_timeout = config
            .alerts
            .smtp
            .as_ref()
            .map(|smtp| smtp.timeout_seconds)
            .unwrap_or(30);
        let dispatcher = Arc::new(
            AlertDispatcher::new(parts.mailer, stats.clone())
                .with_timeout(Duration::from_secs(mail_timeout)),
        );

        let publisher = Arc::new(ChunkPublisher::new(
            parts.directory.clone(),
            parts.store.clone(),
            parts.analysis,
            parts.recommendations,
            parts.transport,
            stats.clone(),
        ));

        let accumulator = Arc::new(
            ChunkAccumulator::new(
                publisher.clone(),
                debouncer.clone(),
                dispatcher.clone(),
                stats.clone(),
            )
            .with_overlap(config.tailing.overlap_lines),
        );

        let supervisor = Arc::new(
            TailSupervisor::new(
                parts.directory.clone(),
                accumulator.clone(),
                config.tailing.clone(),
            )
            .with_root_token(root.clone()),
        );

        let monitor = Arc::new(
            ThresholdMonitor::new(
                parts.store,
                parts.directory.clone(),
                debouncer,
                dispatcher,
                stats.clone(),
            )
            .with_window(config.monitor_window())
            .with_interval(Duration::from_secs(config.monitor.interval_seconds)),
        );

        Self {
            config,
            directory: parts.directory,
            stats,
            accumulator,
            publisher,
            supervisor,
            monitor,
            root,
        }
    }

    /// Start tailing every server the directory knows; returns followers started
    pub async fn start_servers(&self) -> usize {
        let mut started = 0;
        for server_id in self.directory.server_ids() {
            match self.supervisor.start(server_id).await {
                Ok(count) => started += count,
                Err(e) => warn!("Could not start server {}: {}", server_id, e),
            }
        }
        info!("{} follower(s) running", started);
        started
    }

    /// Spawn the threshold monitor and the retry tick
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let monitor = self.monitor.clone();
        let monitor_token = self.root.child_token();
        let monitor_task = tokio::spawn(async move { monitor.run(monitor_token).await });

        let publisher = self.publisher.clone();
        let stats = self.stats.clone();
        let retry_token = self.root.child_token();
        let tick = Duration::from_secs(self.config.collaborators.retry_tick_seconds.max(1));
        let retry_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = retry_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = publisher.process_retry_queue().await;
                        if report.succeeded + report.requeued + report.abandoned > 0 {
                            info!("Retry pass: {:?}", report);
                        }
                        ticks += 1;
                        if ticks % STATS_LOG_EVERY_TICKS == 0 {
                            stats.log_summary();
                        }
                    }
                }
            }
        });

        vec![monitor_task, retry_task]
    }

    /// Cancel everything, wait for the tasks and flush the followers
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        info!("Shutting down pipeline");
        self.root.cancel();
        self.supervisor.stop_all().await;
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        self.stats.log_summary();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
