//! End-to-end run of the pipeline against in-process collaborators

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tailsight::alerts::{InMemoryExpiringStore, LogMailer};
use tailsight::analysis::{BroadcastTransport, MockAnalysisBackend, MockRecommendationBackend};
use tailsight::config::Config;
use tailsight::events::{AnalysisStatus, Level, ParsedEvent, ServerStatus};
use tailsight::storage::{InMemoryDirectory, InMemoryEventStore};
use tailsight::{Pipeline, PipelineParts};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config_for(log: &Path, threshold: u32) -> Config {
    let toml = format!(
        r#"
[tailing]
default_poll_interval_ms = 10
overlap_lines = 1

[[servers]]
id = 1
name = "web-1"
project_id = 3
recipient = "ops@example.com"
log_path = "{}"
alert_keywords = ["OutOfMemoryError"]
error_threshold = {}
"#,
        log.display(),
        threshold
    );
    let config = Config::from_toml_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

fn candidate(problem: &str) -> ParsedEvent {
    ParsedEvent {
        id: None,
        timestamp: Some(chrono::Utc::now()),
        level: Level::Error,
        source: "jvm".to_string(),
        message: "heap exhausted".to_string(),
        problem: Some(problem.to_string()),
        server_id: None,
        raw_artifact_id: None,
        analysis_status: AnalysisStatus::Pending,
    }
}

fn append(path: &Path, content: &str) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

struct Harness {
    pipeline: Pipeline,
    directory: Arc<InMemoryDirectory>,
    store: Arc<InMemoryEventStore>,
    mailer: Arc<LogMailer>,
    transport: Arc<BroadcastTransport>,
    analysis: MockAnalysisBackend,
}

fn harness(config: Config) -> Harness {
    let directory = Arc::new(InMemoryDirectory::from_config(&config));
    let store = Arc::new(InMemoryEventStore::new());
    let mailer = Arc::new(LogMailer::new());
    let transport = Arc::new(BroadcastTransport::new(64));
    let analysis = MockAnalysisBackend::with_events(vec![candidate("memory")]);

    let parts = PipelineParts {
        directory: directory.clone(),
        store: store.clone(),
        silence_store: Arc::new(InMemoryExpiringStore::new()),
        mailer: mailer.clone(),
        analysis: Arc::new(analysis.clone()),
        recommendations: Arc::new(MockRecommendationBackend::with_content("Raise -Xmx")),
        transport: transport.clone(),
    };
    Harness {
        pipeline: Pipeline::new(config, parts, CancellationToken::new()),
        directory,
        store,
        mailer,
        transport,
        analysis,
    }
}

#[tokio::test]
async fn test_lines_flow_from_file_to_subscribers() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("server.log");
    std::fs::write(&log, "2023-12-31T23:59:59 history is skipped\n").unwrap();

    let h = harness(config_for(&log, 100));
    let mut subscriber = h.transport.subscribe();

    assert_eq!(h.pipeline.start_servers().await, 1);
    assert_eq!(h.directory.status(1), Some(ServerStatus::Running));
    tokio::time::sleep(Duration::from_millis(50)).await;

    append(
        &log,
        "2024-01-01T00:00:00 java.lang.OutOfMemoryError: Java heap space\n\
         \tat com.example.Cache.put\n\
         2024-01-01T00:00:01 restarting\n",
    );

    let pushed = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
        .await
        .expect("an event is pushed after the boundary flush")
        .unwrap();
    assert_eq!(pushed.topic, "logs/1");
    assert_eq!(pushed.event.server_id, Some(1));
    assert_eq!(pushed.event.analysis_status, AnalysisStatus::Parsed);

    // The first chunk holds the two lines before the second boundary
    let calls = h.analysis.calls();
    assert_eq!(calls[0].0, "server.log");
    let submitted = String::from_utf8(calls[0].1.clone()).unwrap();
    assert!(submitted.starts_with("2024-01-01T00:00:00 java.lang.OutOfMemoryError"));
    assert!(submitted.ends_with("\tat com.example.Cache.put"));
    assert!(!submitted.contains("history is skipped"));

    let artifacts = h.store.artifacts();
    assert_eq!(artifacts[0].project_id, Some(3));
    assert_eq!(h.store.recommendations()[0].content, "Raise -Xmx");

    // Keyword alert sent once
    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Blocking error detected");
    assert_eq!(sent[0].recipient, "ops@example.com");

    // Stopping flushes the remaining buffer: overlap line plus the last boundary line
    h.pipeline.shutdown(Vec::new()).await;
    let calls = h.analysis.calls();
    assert_eq!(calls.len(), 2);
    let last = String::from_utf8(calls[1].1.clone()).unwrap();
    assert_eq!(last, "\tat com.example.Cache.put\n2024-01-01T00:00:01 restarting");
    assert_eq!(h.directory.status(1), Some(ServerStatus::Stopped));
}

#[tokio::test]
async fn test_threshold_alert_after_published_errors() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("server.log");
    std::fs::write(&log, "").unwrap();

    let h = harness(config_for(&log, 1));
    h.pipeline.start_servers().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    append(
        &log,
        "2024-01-01T00:00:00 first failure\n\
         2024-01-01T00:00:01 second failure\n\
         2024-01-01T00:00:02 third failure\n",
    );
    let mut waited = Duration::ZERO;
    while h.store.events().len() < 2 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert!(h.store.events().len() >= 2);

    let report = h.pipeline.monitor.run_once().await.unwrap();
    assert_eq!(report.exceeded, 1);
    assert_eq!(report.notified, 1);

    let threshold_mails: Vec<_> = h
        .mailer
        .sent()
        .into_iter()
        .filter(|mail| mail.subject == "Error threshold reached")
        .collect();
    assert_eq!(threshold_mails.len(), 1);
    assert!(threshold_mails[0]
        .body
        .starts_with("Error threshold reached for server 1 for error type : memory"));

    // Within the cooldown the same bucket stays silent
    let again = h.pipeline.monitor.run_once().await.unwrap();
    assert_eq!(again.suppressed, 1);

    h.pipeline.shutdown(Vec::new()).await;
}
