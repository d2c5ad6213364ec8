//! Line-to-chunk segmentation
//!
//! Lines read by the followers are grouped into [`EventChunk`]s. A new chunk
//! starts whenever a line begins with an ISO-8601 date-time; the last few lines
//! of the previous chunk are carried over so multi-line records that straddle a
//! boundary are seen twice rather than cut.

use crate::alerts::{AlertDispatcher, KeywordDebouncer};
use crate::events::{file_name_of, EventChunk, ServerId};
use crate::monitoring::PipelineStats;
use crate::BoxFuture;
use dashmap::DashMap;
use log::{debug, info, warn};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

/// Default number of lines carried over after a boundary flush
pub const DEFAULT_OVERLAP: usize = 20;

/// Buffer identity: server and full path of the followed file
///
/// Two files with the same name in different directories keep separate
/// buffers; flushed chunks only carry the final path component.
pub type ChunkKey = (ServerId, String);

/// Destination of flushed chunks
pub trait ChunkSink: Send + Sync {
    /// Take ownership of a flushed chunk
    ///
    /// Failures are handled and logged by the sink; the accumulator does not
    /// retry.
    fn flush<'a>(&'a self, chunk: EventChunk) -> BoxFuture<'a, ()>;
}

/// Lines received for one key since the last flush
#[derive(Debug, Default)]
struct ChunkBuffer {
    lines: Vec<String>,
}

impl ChunkBuffer {
    /// Move the lines out, keeping the last `overlap` of them
    fn take_keeping(&mut self, overlap: usize) -> Vec<String> {
        let keep_from = self.lines.len().saturating_sub(overlap);
        let retained = self.lines[keep_from..].to_vec();
        std::mem::replace(&mut self.lines, retained)
    }
}

fn boundary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").expect("boundary pattern is valid")
    })
}

/// Whether a line opens a new event
pub fn is_boundary(line: &str) -> bool {
    boundary_pattern().is_match(line)
}

/// First keyword contained in `line`, compared case-insensitively
pub fn matching_keyword<'k>(line: &str, keywords: &'k [String]) -> Option<&'k str> {
    let lowered = line.to_lowercase();
    keywords
        .iter()
        .map(|keyword| keyword.trim())
        .filter(|keyword| !keyword.is_empty())
        .find(|keyword| lowered.contains(&keyword.to_lowercase()))
}

/// Groups lines into chunks per (server, followed path)
///
/// Calls for one key are serialized by that key's mutex, which stays held for
/// the whole call including the flush. Different keys only share the sharded
/// map and never wait on each other.
pub struct ChunkAccumulator {
    buffers: DashMap<ChunkKey, Arc<Mutex<ChunkBuffer>>>,
    overlap: usize,
    sink: Arc<dyn ChunkSink>,
    debouncer: Arc<KeywordDebouncer>,
    dispatcher: Arc<AlertDispatcher>,
    stats: Arc<PipelineStats>,
}

impl ChunkAccumulator {
    pub fn new(
        sink: Arc<dyn ChunkSink>,
        debouncer: Arc<KeywordDebouncer>,
        dispatcher: Arc<AlertDispatcher>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            buffers: DashMap::new(),
            overlap: DEFAULT_OVERLAP,
            sink,
            debouncer,
            dispatcher,
            stats,
        }
    }

    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }

    /// Feed one line read from the file at `source` of `server_id`
    ///
    /// A boundary line flushes the non-empty buffer before being appended.
    /// Lines containing one of `keywords` raise at most one debounced
    /// blocking-error alert to `recipient`.
    pub async fn on_line(
        &self,
        server_id: ServerId,
        source: &str,
        line: &str,
        recipient: &str,
        keywords: &[String],
    ) {
        self.stats.record_line();
        let buffer = self.buffer_for(server_id, source);
        let mut buffer = buffer.lock().await;

        if is_boundary(line) && !buffer.lines.is_empty() {
            let lines = buffer.take_keeping(self.overlap);
            debug!(
                "Boundary in {} of server {}: flushing {} lines, keeping {}",
                source,
                server_id,
                lines.len(),
                buffer.lines.len()
            );
            self.emit(server_id, source, lines).await;
        }

        if let Some(keyword) = matching_keyword(line, keywords) {
            self.alert_keyword(server_id, recipient, keyword, line).await;
        }

        buffer.lines.push(line.to_string());
    }

    /// Flush whatever is buffered for the key, without overlap, and forget it
    pub async fn on_end_of_file(&self, server_id: ServerId, source: &str) {
        let key = (server_id, source.to_string());
        let Some(buffer) = self.buffers.get(&key).map(|entry| entry.value().clone()) else {
            return;
        };
        let mut guard = buffer.lock().await;
        let lines = std::mem::take(&mut guard.lines);
        self.buffers
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &buffer));

        if lines.is_empty() {
            return;
        }
        debug!(
            "End of {} for server {}: flushing {} lines",
            source,
            server_id,
            lines.len()
        );
        self.emit(server_id, source, lines).await;
    }

    /// Copy of the lines currently buffered for a key
    pub async fn buffered_lines(&self, server_id: ServerId, source: &str) -> Vec<String> {
        let key = (server_id, source.to_string());
        let Some(buffer) = self.buffers.get(&key).map(|entry| entry.value().clone()) else {
            return Vec::new();
        };
        let guard = buffer.lock().await;
        guard.lines.clone()
    }

    /// Number of keys with live buffers
    pub fn active_keys(&self) -> usize {
        self.buffers.len()
    }

    fn buffer_for(&self, server_id: ServerId, source: &str) -> Arc<Mutex<ChunkBuffer>> {
        // Clone the Arc so the shard lock is released before awaiting
        self.buffers
            .entry((server_id, source.to_string()))
            .or_default()
            .value()
            .clone()
    }

    async fn emit(&self, server_id: ServerId, source: &str, lines: Vec<String>) {
        self.stats.record_chunk();
        let chunk = EventChunk::new(server_id, file_name_of(Path::new(source)), lines);
        self.sink.flush(chunk).await;
    }

    async fn alert_keyword(&self, server_id: ServerId, recipient: &str, keyword: &str, line: &str) {
        if recipient.trim().is_empty() {
            warn!(
                "Keyword '{}' matched on server {} but no recipient is configured",
                keyword, server_id
            );
            return;
        }

        match self
            .debouncer
            .should_notify_for(server_id, &server_id.to_string(), recipient)
            .await
        {
            Ok(true) => {
                info!("Keyword '{}' matched on server {}", keyword, server_id);
                if let Err(e) = self
                    .dispatcher
                    .blocking_error(server_id, recipient, keyword, line)
                    .await
                {
                    warn!("Blocking-error alert for server {} not delivered: {}", server_id, e);
                }
            }
            Ok(false) => {
                self.stats.record_alert_suppressed();
                info!(
                    "Blocking-error alert for server {} suppressed (cooldown active)",
                    server_id
                );
            }
            Err(e) => {
                self.stats.record_alert_suppressed();
                warn!(
                    "Silence store unavailable, skipping alert for server {}: {}",
                    server_id, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{InMemoryExpiringStore, LogMailer};
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        chunks: std::sync::Mutex<Vec<EventChunk>>,
    }

    impl RecordingSink {
        fn chunks(&self) -> Vec<EventChunk> {
            self.chunks.lock().unwrap().clone()
        }
    }

    impl ChunkSink for RecordingSink {
        fn flush<'a>(&'a self, chunk: EventChunk) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.chunks.lock().unwrap().push(chunk);
            })
        }
    }

    struct Harness {
        sink: Arc<RecordingSink>,
        mailer: Arc<LogMailer>,
        accumulator: ChunkAccumulator,
    }

    fn harness(overlap: usize) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let mailer = Arc::new(LogMailer::new());
        let stats = Arc::new(PipelineStats::new());
        let debouncer = Arc::new(KeywordDebouncer::new(
            Arc::new(InMemoryExpiringStore::new()),
            Duration::from_secs(3600),
        ));
        let dispatcher = Arc::new(AlertDispatcher::new(mailer.clone(), stats.clone()));
        let accumulator =
            ChunkAccumulator::new(sink.clone(), debouncer, dispatcher, stats).with_overlap(overlap);
        Harness {
            sink,
            mailer,
            accumulator,
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    /// A line that is either a boundary or a continuation
    #[derive(Debug, Clone)]
    struct TestLine {
        boundary: bool,
        text: String,
    }

    impl TestLine {
        fn render(&self, index: usize) -> String {
            if self.boundary {
                format!("2024-01-01T00:00:{:02} {} #{}", index % 60, self.text, index)
            } else {
                format!("  {} #{}", self.text, index)
            }
        }
    }

    impl Arbitrary for TestLine {
        fn arbitrary(g: &mut Gen) -> Self {
            let words = ["start", "at com.example.Main", "caused by", "ok", "retry"];
            TestLine {
                boundary: bool::arbitrary(g),
                text: g.choose(&words).unwrap().to_string(),
            }
        }
    }

    #[test]
    fn test_boundary_detection() {
        assert!(is_boundary("2024-01-01T00:00:00 start"));
        assert!(is_boundary("2024-01-01T00:00:00.123Z INFO x"));
        assert!(!is_boundary(" 2024-01-01T00:00:00 indented"));
        assert!(!is_boundary("2024-01-01 00:00:00 space separated"));
        assert!(!is_boundary("stack trace line"));
        assert!(!is_boundary(""));
    }

    #[test]
    fn test_matching_keyword_is_case_insensitive() {
        let keywords = vec!["OutOfMemory".to_string(), " ".to_string(), "fatal".to_string()];
        assert_eq!(
            matching_keyword("java.lang.OUTOFMEMORYError", &keywords),
            Some("OutOfMemory")
        );
        assert_eq!(matching_keyword("FATAL: disk", &keywords), Some("fatal"));
        assert_eq!(matching_keyword("all good", &keywords), None);
    }

    #[tokio::test]
    async fn test_first_line_never_flushes() {
        let h = harness(20);
        h.accumulator
            .on_line(1, "app.log", "2024-01-01T00:00:00 start", "", &[])
            .await;
        assert!(h.sink.chunks().is_empty());
        assert_eq!(h.accumulator.buffered_lines(1, "app.log").await.len(), 1);
    }

    // Feature: chunk accumulation, overlap carried into the next chunk
    #[tokio::test]
    async fn test_overlap_scenario() {
        let h = harness(2);
        let lines = [
            "2024-01-01T00:00:00 start",
            "warn: ok",
            "2024-01-01T00:00:05 crash",
            "stack trace line",
        ];
        for line in lines {
            h.accumulator.on_line(1, "app.log", line, "", &[]).await;
        }
        h.accumulator.on_end_of_file(1, "app.log").await;

        let chunks = h.sink.chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].lines, lines[..2].to_vec());
        assert_eq!(chunks[1].lines, lines.to_vec());
        assert_eq!(chunks[1].server_id, 1);
        assert_eq!(chunks[1].file_name, "app.log");
        assert_eq!(h.accumulator.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_same_file_name_in_different_directories() {
        let h = harness(20);
        h.accumulator
            .on_line(1, "/var/log/app/server.log", "2024-01-01T00:00:00 app", "", &[])
            .await;
        h.accumulator
            .on_line(1, "/var/log/err/server.log", "2024-01-01T00:00:00 err", "", &[])
            .await;
        h.accumulator.on_end_of_file(1, "/var/log/err/server.log").await;

        let chunks = h.sink.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].file_name, "server.log");
        assert_eq!(chunks[0].lines, vec!["2024-01-01T00:00:00 err".to_string()]);
        assert_eq!(
            h.accumulator.buffered_lines(1, "/var/log/app/server.log").await,
            vec!["2024-01-01T00:00:00 app".to_string()]
        );
    }

    #[tokio::test]
    async fn test_end_of_file_on_empty_or_unknown_key() {
        let h = harness(20);
        h.accumulator.on_end_of_file(9, "missing.log").await;
        assert!(h.sink.chunks().is_empty());
    }

    #[tokio::test]
    async fn test_zero_overlap_retains_nothing() {
        let h = harness(0);
        h.accumulator.on_line(1, "a", "2024-01-01T00:00:00 x", "", &[]).await;
        h.accumulator.on_line(1, "a", "2024-01-01T00:00:01 y", "", &[]).await;
        assert_eq!(
            h.accumulator.buffered_lines(1, "a").await,
            vec!["2024-01-01T00:00:01 y".to_string()]
        );
    }

    // Feature: chunk accumulation, one alert per matching line
    #[tokio::test]
    async fn test_one_alert_per_line_with_overlapping_keywords() {
        let h = harness(20);
        let keywords = vec!["error".to_string(), "err".to_string()];
        h.accumulator
            .on_line(1, "app.log", "ERROR: disk full", "ops@example.com", &keywords)
            .await;

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "ops@example.com");
    }

    #[tokio::test]
    async fn test_keyword_alerts_are_debounced_per_server() {
        let h = harness(20);
        let keywords = vec!["fatal".to_string()];
        for _ in 0..3 {
            h.accumulator
                .on_line(1, "app.log", "FATAL crash", "ops@example.com", &keywords)
                .await;
        }
        h.accumulator
            .on_line(2, "app.log", "FATAL crash", "ops@example.com", &keywords)
            .await;

        assert_eq!(h.mailer.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_keyword_without_recipient_sends_nothing() {
        let h = harness(20);
        h.accumulator
            .on_line(1, "app.log", "FATAL", "", &["fatal".to_string()])
            .await;
        assert!(h.mailer.sent().is_empty());
        assert_eq!(h.accumulator.buffered_lines(1, "app.log").await.len(), 1);
    }

    // Feature: chunk accumulation, flushes only at boundaries and EOF
    // A flush happens exactly on boundaries over a non-empty buffer, plus once at EOF
    #[quickcheck]
    fn prop_flush_iff_boundary_on_non_empty_buffer(lines: Vec<TestLine>, overlap: u8) -> bool {
        let overlap = (overlap % 5) as usize;
        runtime().block_on(async {
            let h = harness(overlap);
            let mut expected = 0;
            let mut model_len = 0usize;
            for (i, line) in lines.iter().enumerate() {
                if line.boundary && model_len > 0 {
                    expected += 1;
                    model_len = model_len.min(overlap);
                }
                model_len += 1;
                h.accumulator
                    .on_line(1, "app.log", &line.render(i), "", &[])
                    .await;
            }
            if model_len > 0 {
                expected += 1;
            }
            h.accumulator.on_end_of_file(1, "app.log").await;
            h.sink.chunks().len() == expected
        })
    }

    // Feature: chunk accumulation, retained overlap is a suffix
    // After a boundary flush the buffer holds the last min(overlap, len) lines
    // of the flushed chunk, followed by the boundary line
    #[quickcheck]
    fn prop_overlap_is_suffix_of_flushed_chunk(lines: Vec<TestLine>, overlap: u8) -> bool {
        let overlap = (overlap % 25) as usize;
        runtime().block_on(async {
            let h = harness(overlap);
            for (i, line) in lines.iter().enumerate() {
                let rendered = line.render(i);
                let before = h.sink.chunks().len();
                h.accumulator.on_line(1, "app.log", &rendered, "", &[]).await;
                let chunks = h.sink.chunks();
                if chunks.len() > before {
                    let flushed = &chunks[chunks.len() - 1].lines;
                    let keep = overlap.min(flushed.len());
                    let mut expected = flushed[flushed.len() - keep..].to_vec();
                    expected.push(rendered);
                    if h.accumulator.buffered_lines(1, "app.log").await != expected {
                        return false;
                    }
                }
            }
            true
        })
    }

    // Feature: chunk accumulation, keys are isolated
    // Concurrent keys never see each other's lines
    #[quickcheck]
    fn prop_keys_are_isolated(lines: Vec<TestLine>) -> bool {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = Arc::new(harness(3));
            let mut tasks = Vec::new();
            for (server_id, file_name) in [(1, "app.log"), (1, "error.log"), (2, "app.log")] {
                let h = h.clone();
                let lines = lines.clone();
                tasks.push(tokio::spawn(async move {
                    for (i, line) in lines.iter().enumerate() {
                        let tagged = format!("{} [{}:{}]", line.render(i), server_id, file_name);
                        h.accumulator
                            .on_line(server_id, file_name, &tagged, "", &[])
                            .await;
                        tokio::task::yield_now().await;
                    }
                    h.accumulator.on_end_of_file(server_id, file_name).await;
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }

            h.sink.chunks().iter().all(|chunk| {
                let tag = format!("[{}:{}]", chunk.server_id, chunk.file_name);
                chunk.lines.iter().all(|line| line.ends_with(&tag))
            })
        })
    }
}
