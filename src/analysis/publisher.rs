use crate::aggregator::ChunkSink;
use crate::analysis::backends::{AnalysisBackend, RecommendationBackend};
use crate::analysis::transport::{topic_for, PushTransport};
use crate::error::AnalysisError;
use crate::events::{AnalysisStatus, EventChunk, ParsedEvent, RawArtifact};
use crate::monitoring::PipelineStats;
use crate::storage::{EventStore, ServerDirectory};
use crate::BoxFuture;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Enrichment step that failed and must be attempted again
#[derive(Debug, Clone)]
enum RetryStage {
    /// The persisted artifact still needs parsing
    Analysis { artifact: RawArtifact },
    /// The persisted event still needs recommendations
    Recommendations { event: ParsedEvent },
}

impl RetryStage {
    fn describe(&self) -> String {
        match self {
            RetryStage::Analysis { artifact } => format!(
                "analysis of artifact {:?} ({})",
                artifact.id, artifact.file_name
            ),
            RetryStage::Recommendations { event } => {
                format!("recommendations for event {:?}", event.id)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct RetryEntry {
    stage: RetryStage,
    attempt_count: u32,
    next_retry_time: Instant,
}

/// Result of one pass over the retry queue
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub succeeded: usize,
    pub requeued: usize,
    pub abandoned: usize,
}

/// Persists flushed chunks, enriches them and pushes the parsed events
///
/// The raw artifact is committed before any collaborator is called, so a
/// failing service never loses the chunk. Failed analysis or recommendation
/// calls go to a bounded retry queue with exponential backoff.
pub struct ChunkPublisher {
    directory: Arc<dyn ServerDirectory>,
    store: Arc<dyn EventStore>,
    analysis: Arc<dyn AnalysisBackend>,
    recommendations: Arc<dyn RecommendationBackend>,
    transport: Arc<dyn PushTransport>,
    stats: Arc<PipelineStats>,
    retry_queue: Mutex<VecDeque<RetryEntry>>,
    max_retry_attempts: u32,
    max_queue_size: usize,
    base_retry_delay: Duration,
}

impl ChunkPublisher {
    pub fn new(
        directory: Arc<dyn ServerDirectory>,
        store: Arc<dyn EventStore>,
        analysis: Arc<dyn AnalysisBackend>,
        recommendations: Arc<dyn RecommendationBackend>,
        transport: Arc<dyn PushTransport>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            directory,
            store,
            analysis,
            recommendations,
            transport,
            stats,
            retry_queue: Mutex::new(VecDeque::new()),
            max_retry_attempts: 3,
            max_queue_size: 100,
            base_retry_delay: Duration::from_secs(1),
        }
    }

    /// Override the first retry delay; later ones double from it
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size.max(1);
        self
    }

    /// Persist and enrich a chunk; returns the number of events published
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::Storage` when the raw artifact cannot be saved,
    /// or the analysis failure after queueing a retry.
    pub async fn publish(&self, chunk: EventChunk) -> Result<usize, AnalysisError> {
        let project_id = match self.directory.server(chunk.server_id) {
            Some(server) => server.project_id,
            None => {
                warn!(
                    "Server {} is unknown, storing chunk without a project",
                    chunk.server_id
                );
                None
            }
        };

        let artifact = self
            .store
            .save_artifact(RawArtifact::from_chunk(&chunk, project_id))
            .await?;
        debug!(
            "Stored {} lines of {} as artifact {:?}",
            chunk.len(),
            chunk.file_name,
            artifact.id
        );

        match self.enrich_artifact(&artifact).await {
            Ok(published) => Ok(published),
            Err(e) => {
                self.stats.record_enrichment_failure();
                warn!("Analysis of {} failed, queuing for retry: {}", chunk.file_name, e);
                self.queue_for_retry(RetryStage::Analysis { artifact });
                Err(e)
            }
        }
    }

    /// Retry every queued entry whose backoff has elapsed
    pub async fn process_retry_queue(&self) -> RetryReport {
        let mut report = RetryReport::default();
        let now = Instant::now();

        let mut ready_entries = Vec::new();
        {
            let mut queue = self.lock_queue();
            let mut i = 0;
            while i < queue.len() {
                if queue[i].next_retry_time <= now {
                    if let Some(entry) = queue.remove(i) {
                        ready_entries.push(entry);
                    }
                } else {
                    i += 1;
                }
            }
        }

        for mut entry in ready_entries {
            debug!(
                "Retrying {} (attempt {})",
                entry.stage.describe(),
                entry.attempt_count + 1
            );

            let result = match &entry.stage {
                RetryStage::Analysis { artifact } => self.enrich_artifact(artifact).await,
                RetryStage::Recommendations { event } => self.enrich_event(event).await,
            };

            match result {
                Ok(_) => {
                    info!("Retry of {} succeeded", entry.stage.describe());
                    report.succeeded += 1;
                }
                Err(e) => {
                    self.stats.record_enrichment_failure();
                    entry.attempt_count += 1;

                    if entry.attempt_count < self.max_retry_attempts {
                        let delay = self.base_retry_delay * 2_u32.pow(entry.attempt_count - 1);
                        entry.next_retry_time = Instant::now() + delay;

                        let mut queue = self.lock_queue();
                        if queue.len() < self.max_queue_size {
                            debug!("Re-queued {} with delay {:?}", entry.stage.describe(), delay);
                            queue.push_back(entry);
                            report.requeued += 1;
                        } else {
                            warn!("Retry queue full, dropping {}", entry.stage.describe());
                            report.abandoned += 1;
                        }
                    } else {
                        error!(
                            "Giving up on {} after {} attempts: {}",
                            entry.stage.describe(),
                            entry.attempt_count,
                            e
                        );
                        report.abandoned += 1;
                    }
                }
            }
        }

        report
    }

    pub fn retry_queue_size(&self) -> usize {
        self.lock_queue().len()
    }

    /// Parse a stored artifact and handle every resulting event
    async fn enrich_artifact(&self, artifact: &RawArtifact) -> Result<usize, AnalysisError> {
        let candidates = self
            .analysis
            .analyze(&artifact.file_name, artifact.data.clone())
            .await?;

        if let Some(id) = artifact.id {
            if let Err(e) = self.store.mark_artifact_analyzed(id).await {
                warn!("Failed to mark artifact {} analyzed: {}", id, e);
            }
        }

        let mut published = 0;
        for mut event in candidates {
            event.server_id = Some(artifact.server_id);
            event.raw_artifact_id = artifact.id;
            event.analysis_status = AnalysisStatus::Parsed;

            let event = match self.store.save_event(event).await {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        "Failed to store event from artifact {:?}: {}",
                        artifact.id, e
                    );
                    continue;
                }
            };

            if let Err(e) = self.enrich_event(&event).await {
                self.stats.record_enrichment_failure();
                warn!(
                    "Recommendations for event {:?} failed, queuing for retry: {}",
                    event.id, e
                );
                self.queue_for_retry(RetryStage::Recommendations {
                    event: event.clone(),
                });
            }

            self.transport
                .publish(&topic_for(artifact.server_id), &event);
            published += 1;
        }

        self.stats.record_published(published as u64);
        info!(
            "Artifact {:?} of server {} yielded {} event(s)",
            artifact.id, artifact.server_id, published
        );
        Ok(published)
    }

    /// Fetch and store recommendations for a persisted event
    async fn enrich_event(&self, event: &ParsedEvent) -> Result<usize, AnalysisError> {
        let recommendations = self.recommendations.recommend(event).await?;
        if recommendations.is_empty() {
            return Ok(0);
        }
        let saved = self.store.save_recommendations(recommendations).await?;
        debug!(
            "Stored {} recommendation(s) for event {:?}",
            saved.len(),
            event.id
        );
        Ok(saved.len())
    }

    fn queue_for_retry(&self, stage: RetryStage) {
        let mut queue = self.lock_queue();

        if queue.len() >= self.max_queue_size {
            warn!("Retry queue is full, dropping oldest entry");
            queue.pop_front();
        }

        queue.push_back(RetryEntry {
            stage,
            attempt_count: 1,
            next_retry_time: Instant::now() + self.base_retry_delay,
        });
        debug!("Retry queue size: {}", queue.len());
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<RetryEntry>> {
        self.retry_queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChunkSink for ChunkPublisher {
    fn flush<'a>(&'a self, chunk: EventChunk) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let server_id = chunk.server_id;
            let file_name = chunk.file_name.clone();
            if let Err(e) = self.publish(chunk).await {
                error!(
                    "Failed to publish chunk of {} for server {}: {}",
                    file_name, server_id, e
                );
            }
        })
    }
}
