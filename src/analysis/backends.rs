use crate::error::AnalysisError;
use crate::events::{AnalysisStatus, Level, ParsedEvent, Recommendation, Timestamp};
use crate::BoxFuture;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// File name under which an event projection is submitted for recommendations
pub const RECOMMENDATION_FILE_NAME: &str = "log.json";

/// Service that turns raw chunk bytes into parsed events
pub trait AnalysisBackend: Send + Sync {
    /// Submit `content` as a file named `file_name`
    ///
    /// Returned events carry no server, artifact or id yet and have status
    /// `Pending`.
    fn analyze<'a>(
        &'a self,
        file_name: &'a str,
        content: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<ParsedEvent>, AnalysisError>>;
}

/// Service that proposes remediation hints for one parsed event
pub trait RecommendationBackend: Send + Sync {
    fn recommend<'a>(
        &'a self,
        event: &'a ParsedEvent,
    ) -> BoxFuture<'a, Result<Vec<Recommendation>, AnalysisError>>;
}

/// Event candidate as returned by the analysis service
#[derive(Debug, Deserialize)]
struct AnalysisCandidate {
    #[serde(default)]
    timestamp: Option<String>,
    level: Level,
    #[serde(default)]
    source: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    problem: Option<String>,
}

impl From<AnalysisCandidate> for ParsedEvent {
    fn from(candidate: AnalysisCandidate) -> Self {
        ParsedEvent {
            id: None,
            timestamp: candidate.timestamp.as_deref().and_then(parse_timestamp),
            level: candidate.level,
            source: candidate.source,
            message: candidate.message,
            problem: candidate.problem.filter(|p| !p.trim().is_empty()),
            server_id: None,
            raw_artifact_id: None,
            analysis_status: AnalysisStatus::Pending,
        }
    }
}

/// Recommendation as returned by the recommendation service
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationCandidate {
    content: String,
    #[serde(default)]
    relevance_score: f32,
    #[serde(default)]
    generated_by: String,
    #[serde(default)]
    creation_date: Option<String>,
}

impl From<RecommendationCandidate> for Recommendation {
    fn from(candidate: RecommendationCandidate) -> Self {
        Recommendation {
            id: None,
            event_id: None,
            content: candidate.content,
            relevance_score: candidate.relevance_score,
            generated_by: candidate.generated_by,
            creation_date: candidate.creation_date.as_deref().and_then(parse_timestamp),
        }
    }
}

/// Parse an RFC 3339 timestamp, or a zone-less one taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    debug!("Unparseable timestamp from collaborator: {}", raw);
    None
}

fn build_client(timeout: Duration) -> Result<Client, AnalysisError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// POST a single multipart `file` field and decode the JSON array reply
async fn post_file<T: serde::de::DeserializeOwned>(
    client: &Client,
    url: &str,
    file_name: &str,
    mime: &str,
    content: Vec<u8>,
) -> Result<Vec<T>, AnalysisError> {
    let part = Part::bytes(content)
        .file_name(file_name.to_string())
        .mime_str(mime)?;
    let form = Form::new().part("file", part);

    let response = client
        .post(url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout
            } else {
                AnalysisError::HttpError(e)
            }
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(AnalysisError::BackendError(format!(
            "{} returned {}: {}",
            url, status, error_text
        )));
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        AnalysisError::InvalidResponse(format!("Expected a JSON array from {}: {}", url, e))
    })
}

/// HTTP client of the log parsing service
pub struct HttpAnalysisClient {
    client: Client,
    url: String,
}

impl HttpAnalysisClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AnalysisError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AnalysisBackend for HttpAnalysisClient {
    fn analyze<'a>(
        &'a self,
        file_name: &'a str,
        content: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<ParsedEvent>, AnalysisError>> {
        Box::pin(async move {
            debug!("Submitting {} ({} bytes) for analysis", file_name, content.len());
            let candidates: Vec<AnalysisCandidate> =
                post_file(&self.client, &self.url, file_name, "text/plain", content).await?;
            Ok(candidates.into_iter().map(ParsedEvent::from).collect())
        })
    }
}

/// HTTP client of the recommendation service
pub struct HttpRecommendationClient {
    client: Client,
    url: String,
}

impl HttpRecommendationClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AnalysisError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

impl RecommendationBackend for HttpRecommendationClient {
    fn recommend<'a>(
        &'a self,
        event: &'a ParsedEvent,
    ) -> BoxFuture<'a, Result<Vec<Recommendation>, AnalysisError>> {
        Box::pin(async move {
            let payload = serde_json::to_vec(&[event.projection()]).map_err(|e| {
                AnalysisError::InvalidResponse(format!("Cannot encode event projection: {}", e))
            })?;
            let candidates: Vec<RecommendationCandidate> = post_file(
                &self.client,
                &self.url,
                RECOMMENDATION_FILE_NAME,
                "application/json",
                payload,
            )
            .await?;
            Ok(candidates
                .into_iter()
                .map(|candidate| {
                    let mut recommendation = Recommendation::from(candidate);
                    recommendation.event_id = event.id;
                    recommendation
                })
                .collect())
        })
    }
}

/// Scripted analysis backend for tests and offline runs
///
/// Responses are returned in order, cycling after the last one. An `Err`
/// entry fails the call with `AnalysisError::BackendError`.
#[derive(Clone)]
pub struct MockAnalysisBackend {
    responses: Vec<Result<Vec<ParsedEvent>, String>>,
    index: Arc<Mutex<usize>>,
    calls: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    delay: Option<Duration>,
}

impl MockAnalysisBackend {
    pub fn with_responses(responses: Vec<Result<Vec<ParsedEvent>, String>>) -> Self {
        Self {
            responses,
            index: Arc::new(Mutex::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Always return the same events
    pub fn with_events(events: Vec<ParsedEvent>) -> Self {
        Self::with_responses(vec![Ok(events)])
    }

    pub fn failing() -> Self {
        Self::with_responses(vec![Err("mock analysis failure".to_string())])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// File names and contents received so far
    pub fn calls(&self) -> Vec<(String, Vec<u8>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AnalysisBackend for MockAnalysisBackend {
    fn analyze<'a>(
        &'a self,
        file_name: &'a str,
        content: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<ParsedEvent>, AnalysisError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((file_name.to_string(), content));

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let response = {
                let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
                if self.responses.is_empty() {
                    return Ok(Vec::new());
                }
                let response = self.responses[*index % self.responses.len()].clone();
                *index += 1;
                response
            };
            response.map_err(AnalysisError::BackendError)
        })
    }
}

/// Scripted recommendation backend, cycling like [`MockAnalysisBackend`]
#[derive(Clone)]
pub struct MockRecommendationBackend {
    responses: Vec<Result<Vec<Recommendation>, String>>,
    index: Arc<Mutex<usize>>,
    calls: Arc<Mutex<Vec<ParsedEvent>>>,
}

impl MockRecommendationBackend {
    pub fn with_responses(responses: Vec<Result<Vec<Recommendation>, String>>) -> Self {
        Self {
            responses,
            index: Arc::new(Mutex::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// One recommendation with the given content for every event
    pub fn with_content(content: &str) -> Self {
        Self::with_responses(vec![Ok(vec![Recommendation {
            id: None,
            event_id: None,
            content: content.to_string(),
            relevance_score: 1.0,
            generated_by: "mock".to_string(),
            creation_date: None,
        }])])
    }

    pub fn empty() -> Self {
        Self::with_responses(vec![Ok(Vec::new())])
    }

    pub fn failing() -> Self {
        Self::with_responses(vec![Err("mock recommendation failure".to_string())])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl RecommendationBackend for MockRecommendationBackend {
    fn recommend<'a>(
        &'a self,
        event: &'a ParsedEvent,
    ) -> BoxFuture<'a, Result<Vec<Recommendation>, AnalysisError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event.clone());

            let response = {
                let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
                if self.responses.is_empty() {
                    return Ok(Vec::new());
                }
                let response = self.responses[*index % self.responses.len()].clone();
                *index += 1;
                response
            };
            response
                .map(|recommendations| {
                    recommendations
                        .into_iter()
                        .map(|mut r| {
                            r.event_id = event.id;
                            r
                        })
                        .collect()
                })
                .map_err(AnalysisError::BackendError)
        })
    }
}
