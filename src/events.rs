//! Core data model for the tailing pipeline
//!
//! This module defines the values that flow between the followers, the chunk
//! accumulator, the publisher and the threshold monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Identifier of a monitored server
pub type ServerId = u32;

/// A single file being followed for a server
///
/// One target exists per distinct path. The log path and the error-log path of
/// a server produce two targets when they differ.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchTarget {
    /// Server that owns the file
    pub server_id: ServerId,
    /// Absolute path of the followed file
    pub path: PathBuf,
    /// Keywords that raise a blocking-error alert when found in a line
    pub alert_keywords: Vec<String>,
    /// Who receives keyword alerts for this server
    pub recipient: String,
    /// Delay between two read attempts
    pub poll_interval: Duration,
}

/// Final component of `path`, or the whole path when it has none
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Immutable unit of lines flushed by the chunk accumulator
///
/// A chunk is handed to exactly one sink by value, so it can only be
/// published once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventChunk {
    pub server_id: ServerId,
    pub file_name: String,
    pub lines: Vec<String>,
    pub created_at: Timestamp,
}

impl EventChunk {
    pub fn new(server_id: ServerId, file_name: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            server_id,
            file_name: file_name.into(),
            lines,
            created_at: Utc::now(),
        }
    }

    /// Raw content of the chunk: lines joined by newlines, UTF-8 encoded
    pub fn to_bytes(&self) -> Vec<u8> {
        self.lines.join("\n").into_bytes()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Severity level reported by the analysis service
///
/// Unknown labels are preserved verbatim instead of being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Other(String),
}

impl Level {
    pub fn as_str(&self) -> &str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
            Level::Other(label) => label,
        }
    }
}

impl From<String> for Level {
    fn from(label: String) -> Self {
        match label.trim().to_uppercase().as_str() {
            "TRACE" => Level::Trace,
            "DEBUG" => Level::Debug,
            "INFO" => Level::Info,
            "WARN" | "WARNING" => Level::Warning,
            "ERROR" => Level::Error,
            "FATAL" => Level::Fatal,
            _ => Level::Other(label),
        }
    }
}

impl From<Level> for String {
    fn from(level: Level) -> Self {
        level.as_str().to_string()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parsed event stands in the enrichment flow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnalysisStatus {
    /// Returned by the analysis service, not yet linked to its chunk
    Pending,
    /// Linked to its chunk and persisted
    Parsed,
}

/// Event extracted from a chunk by the analysis service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedEvent {
    /// Store-assigned identifier, `None` until persisted
    pub id: Option<u64>,
    /// When the event happened; the analysis service may not find one
    pub timestamp: Option<Timestamp>,
    pub level: Level,
    pub source: String,
    pub message: String,
    /// Problem signature used for threshold bucketing
    pub problem: Option<String>,
    /// Server the originating chunk was read from
    pub server_id: Option<ServerId>,
    /// Raw artifact the event was extracted from
    pub raw_artifact_id: Option<u64>,
    pub analysis_status: AnalysisStatus,
}

impl ParsedEvent {
    pub fn is_error(&self) -> bool {
        self.level == Level::Error
    }

    /// Minimal projection submitted to the recommendation service
    pub fn projection(&self) -> serde_json::Value {
        serde_json::json!({
            "timestamp": self.timestamp.map(|ts| ts.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string()),
            "level": self.level.as_str(),
            "source": self.source,
            "message": self.message,
            "problem": self.problem,
        })
    }
}

/// Remediation hint attached to a parsed event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub id: Option<u64>,
    pub event_id: Option<u64>,
    pub content: String,
    pub relevance_score: f32,
    pub generated_by: String,
    pub creation_date: Option<Timestamp>,
}

/// Lifecycle of a captured raw chunk
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArtifactStatus {
    New,
    Analyzed,
}

/// Raw chunk content persisted before any enrichment happens
#[derive(Debug, Clone, PartialEq)]
pub struct RawArtifact {
    pub id: Option<u64>,
    pub project_id: Option<u32>,
    pub server_id: ServerId,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub uploaded_at: Timestamp,
    pub status: ArtifactStatus,
    pub data: Vec<u8>,
}

impl RawArtifact {
    /// Build an unsaved artifact from a flushed chunk
    pub fn from_chunk(chunk: &EventChunk, project_id: Option<u32>) -> Self {
        let data = chunk.to_bytes();
        Self {
            id: None,
            project_id,
            server_id: chunk.server_id,
            file_name: chunk.file_name.clone(),
            content_type: "text/plain".to_string(),
            size: data.len() as u64,
            uploaded_at: Utc::now(),
            status: ArtifactStatus::New,
            data,
        }
    }
}

/// Aggregation bucket used by the threshold monitor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThresholdKey {
    pub server_id: ServerId,
    pub problem: Option<String>,
}

impl ThresholdKey {
    /// Debounce subject for this bucket
    pub fn subject(&self) -> String {
        format!("{}:{}", self.server_id, self.problem_label())
    }

    pub fn problem_label(&self) -> &str {
        self.problem.as_deref().unwrap_or("unknown")
    }
}

impl fmt::Display for ThresholdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server {} / {}", self.server_id, self.problem_label())
    }
}

/// Tailing state exposed on a server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
}
