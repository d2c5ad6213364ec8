//! Polling follower for a single growing file
//!
//! The follower remembers its byte offset and, on every poll, reads whatever was
//! appended since. Complete lines go to the chunk accumulator; a trailing partial
//! line waits for its newline. A changed file identity (rotation) or a length
//! below the offset (truncation) makes it start over from the beginning of the
//! new content.

use crate::aggregator::ChunkAccumulator;
use crate::error::TailError;
use crate::events::WatchTarget;
use log::{debug, info, warn};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Why a follower returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    /// Its token was cancelled
    Cancelled,
    /// The file stayed unreadable for too many consecutive polls
    GaveUp,
}

/// Open file and the position reached in it
struct Cursor {
    file: File,
    offset: u64,
    identity: Option<u64>,
}

/// Follows one [`WatchTarget`] until cancelled or the file is gone for good
pub struct Follower {
    target: WatchTarget,
    /// Full path as text, keys this follower's chunk buffer
    source: String,
    accumulator: Arc<ChunkAccumulator>,
    max_consecutive_misses: u32,
    read_from_start: bool,
    cursor: Option<Cursor>,
    /// Bytes after the last newline seen
    partial: Vec<u8>,
    opened_once: bool,
}

impl Follower {
    pub fn new(target: WatchTarget, accumulator: Arc<ChunkAccumulator>) -> Self {
        let source = target.path.to_string_lossy().into_owned();
        Self {
            target,
            source,
            accumulator,
            max_consecutive_misses: 5,
            read_from_start: false,
            cursor: None,
            partial: Vec::new(),
            opened_once: false,
        }
    }

    pub fn with_max_consecutive_misses(mut self, misses: u32) -> Self {
        self.max_consecutive_misses = misses.max(1);
        self
    }

    /// Process content already in the file when it is first opened
    pub fn with_read_from_start(mut self, read_from_start: bool) -> Self {
        self.read_from_start = read_from_start;
        self
    }

    /// Poll the file until `token` is cancelled or the file stays unreadable
    ///
    /// Either way the key's buffer is flushed through
    /// [`ChunkAccumulator::on_end_of_file`] before returning.
    pub async fn run(mut self, token: CancellationToken) -> FollowOutcome {
        info!(
            "Following {} for server {}",
            self.target.path.display(),
            self.target.server_id
        );
        let mut misses = 0u32;

        let outcome = loop {
            if token.is_cancelled() {
                break FollowOutcome::Cancelled;
            }

            match self.poll(&token).await {
                Ok(lines) => {
                    if misses > 0 {
                        info!("{} is readable again", self.target.path.display());
                    }
                    misses = 0;
                    if lines > 0 {
                        debug!("Read {} line(s) from {}", lines, self.target.path.display());
                    }
                }
                Err(e) => {
                    misses += 1;
                    self.cursor = None;
                    warn!(
                        "Poll {}/{} of {} failed: {}",
                        misses,
                        self.max_consecutive_misses,
                        self.target.path.display(),
                        e
                    );
                    if misses >= self.max_consecutive_misses {
                        warn!(
                            "Giving up on {} for server {}",
                            self.target.path.display(),
                            self.target.server_id
                        );
                        break FollowOutcome::GaveUp;
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => break FollowOutcome::Cancelled,
                _ = tokio::time::sleep(self.target.poll_interval) => {}
            }
        };

        self.accumulator
            .on_end_of_file(self.target.server_id, &self.source)
            .await;
        info!(
            "Stopped following {} for server {} ({:?})",
            self.target.path.display(),
            self.target.server_id,
            outcome
        );
        outcome
    }

    /// Read newly appended content; returns the number of lines forwarded
    async fn poll(&mut self, token: &CancellationToken) -> Result<usize, TailError> {
        let metadata = tokio::fs::metadata(&self.target.path).await?;
        if !metadata.is_file() {
            return Err(TailError::Unreadable(format!(
                "{} is not a regular file",
                self.target.path.display()
            )));
        }

        let identity = file_identity(&metadata);
        let length = metadata.len();
        let mut forwarded = 0;

        let reopen = match &self.cursor {
            None => true,
            Some(cursor) if cursor.identity != identity => {
                info!("{} was rotated, reopening", self.target.path.display());
                true
            }
            Some(cursor) if length < cursor.offset => {
                info!("{} was truncated, reopening", self.target.path.display());
                true
            }
            Some(_) => false,
        };

        if reopen {
            if self.cursor.is_some() {
                forwarded += self.flush_partial(token).await;
            }
            let mut file = File::open(&self.target.path).await?;
            let offset = if !self.opened_once && !self.read_from_start {
                length
            } else {
                0
            };
            file.seek(SeekFrom::Start(offset)).await?;
            self.cursor = Some(Cursor {
                file,
                offset,
                identity,
            });
            self.opened_once = true;
        }

        let mut chunk = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                break;
            };
            let read = cursor.file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            cursor.offset += read as u64;
            self.partial.extend_from_slice(&chunk[..read]);
            forwarded += self.forward_complete_lines(token).await;
            if token.is_cancelled() {
                break;
            }
        }

        Ok(forwarded)
    }

    /// Forward every newline-terminated line held in the partial buffer
    async fn forward_complete_lines(&mut self, token: &CancellationToken) -> usize {
        let mut forwarded = 0;
        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=newline).collect();
            if token.is_cancelled() {
                continue;
            }
            let line = decode_line(&raw[..raw.len() - 1]);
            self.forward(&line).await;
            forwarded += 1;
        }
        forwarded
    }

    /// Forward the unterminated tail left behind by a rotated or truncated file
    async fn flush_partial(&mut self, token: &CancellationToken) -> usize {
        if self.partial.is_empty() || token.is_cancelled() {
            self.partial.clear();
            return 0;
        }
        let raw = std::mem::take(&mut self.partial);
        let line = decode_line(&raw);
        self.forward(&line).await;
        1
    }

    async fn forward(&self, line: &str) {
        self.accumulator
            .on_line(
                self.target.server_id,
                &self.source,
                line,
                &self.target.recipient,
                &self.target.alert_keywords,
            )
            .await;
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    line.strip_suffix('\r').unwrap_or(&line).to_string()
}

/// Identity of the file behind a path, used to detect rotation
#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ChunkSink;
    use crate::alerts::{AlertDispatcher, InMemoryExpiringStore, KeywordDebouncer, LogMailer};
    use crate::events::EventChunk;
    use crate::monitoring::PipelineStats;
    use crate::BoxFuture;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        chunks: std::sync::Mutex<Vec<EventChunk>>,
    }

    impl ChunkSink for RecordingSink {
        fn flush<'a>(&'a self, chunk: EventChunk) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.chunks.lock().unwrap().push(chunk);
            })
        }
    }

    impl RecordingSink {
        fn all_lines(&self) -> Vec<String> {
            // Overlap duplicates lines across chunks; with overlap 0 they are disjoint
            self.chunks
                .lock()
                .unwrap()
                .iter()
                .flat_map(|chunk| chunk.lines.clone())
                .collect()
        }
    }

    fn accumulator(sink: Arc<RecordingSink>) -> Arc<ChunkAccumulator> {
        let stats = Arc::new(PipelineStats::new());
        let debouncer = Arc::new(KeywordDebouncer::new(
            Arc::new(InMemoryExpiringStore::new()),
            Duration::from_secs(60),
        ));
        let dispatcher = Arc::new(AlertDispatcher::new(Arc::new(LogMailer::new()), stats.clone()));
        Arc::new(ChunkAccumulator::new(sink, debouncer, dispatcher, stats).with_overlap(0))
    }

    fn target(path: &Path) -> WatchTarget {
        WatchTarget {
            server_id: 1,
            path: path.to_path_buf(),
            alert_keywords: vec![],
            recipient: "ops@example.com".to_string(),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[test]
    fn test_decode_line_trims_carriage_return() {
        assert_eq!(decode_line(b"hello\r"), "hello");
        assert_eq!(decode_line(b"hello"), "hello");
        assert_eq!(decode_line(b"caf\xc3\xa9"), "café");
    }

    #[tokio::test]
    async fn test_follows_appended_lines_from_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "old line\n");

        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let follower = Follower::new(target(&path), accumulator(sink.clone()));
        let handle = tokio::spawn(follower.run(token.clone()));
        settle().await;

        append(&path, "first\r\nsecond\npart");
        settle().await;
        append(&path, "ial\n");
        settle().await;

        token.cancel();
        assert_eq!(handle.await.unwrap(), FollowOutcome::Cancelled);
        assert_eq!(sink.all_lines(), vec!["first", "second", "partial"]);
    }

    #[tokio::test]
    async fn test_read_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "existing\n");

        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let follower =
            Follower::new(target(&path), accumulator(sink.clone())).with_read_from_start(true);
        let handle = tokio::spawn(follower.run(token.clone()));
        settle().await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(sink.all_lines(), vec!["existing"]);
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_beginning() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let follower = Follower::new(target(&path), accumulator(sink.clone()));
        let handle = tokio::spawn(follower.run(token.clone()));
        settle().await;

        append(&path, "a long first line\n");
        settle().await;
        std::fs::write(&path, "new\n").unwrap();
        settle().await;

        token.cancel();
        handle.await.unwrap();
        assert_eq!(sink.all_lines(), vec!["a long first line", "new"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_switches_to_new_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let follower = Follower::new(target(&path), accumulator(sink.clone()));
        let handle = tokio::spawn(follower.run(token.clone()));
        settle().await;

        append(&path, "before rotation\n");
        settle().await;
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "after rotation and longer than before\n");
        settle().await;

        token.cancel();
        handle.await.unwrap();
        assert_eq!(
            sink.all_lines(),
            vec!["before rotation", "after rotation and longer than before"]
        );
    }

    #[tokio::test]
    async fn test_gives_up_after_consecutive_misses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.log");

        let sink = Arc::new(RecordingSink::default());
        let follower = Follower::new(target(&path), accumulator(sink.clone()))
            .with_max_consecutive_misses(3);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            follower.run(CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(outcome, FollowOutcome::GaveUp);
    }

    #[tokio::test]
    async fn test_cancel_flushes_buffered_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let follower = Follower::new(target(&path), accumulator(sink.clone()));
        let handle = tokio::spawn(follower.run(token.clone()));
        settle().await;

        append(&path, "2024-01-01T00:00:00 one\ncontinuation\n");
        settle().await;
        assert!(sink.chunks.lock().unwrap().is_empty());

        token.cancel();
        handle.await.unwrap();
        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].lines.len(), 2);
        assert_eq!(chunks[0].file_name, "app.log");
    }
}
