//! Seams towards the persistence layer
//!
//! Durable storage of servers, raw chunks and parsed events lives outside this
//! crate. The pipeline only talks to it through [`ServerDirectory`] and
//! [`EventStore`]; the in-memory implementations back the daemon when no
//! external store is wired in, and the tests.

use crate::config::{Config, ServerConfig};
use crate::error::StoreError;
use crate::events::{
    ArtifactStatus, ParsedEvent, RawArtifact, Recommendation, ServerId, ServerStatus, Timestamp,
};
use crate::BoxFuture;
use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Lookup of server configurations and their tailing status
#[cfg_attr(test, mockall::automock)]
pub trait ServerDirectory: Send + Sync {
    /// Resolve a server, `None` when it no longer exists
    fn server(&self, id: ServerId) -> Option<ServerConfig>;

    /// Every known server id
    fn server_ids(&self) -> Vec<ServerId>;

    /// Record the tailing status of a server
    fn set_status(&self, id: ServerId, status: ServerStatus) -> Result<(), StoreError>;
}

/// Persistence of raw chunks, parsed events and recommendations
pub trait EventStore: Send + Sync {
    fn save_artifact<'a>(
        &'a self,
        artifact: RawArtifact,
    ) -> BoxFuture<'a, Result<RawArtifact, StoreError>>;

    fn mark_artifact_analyzed<'a>(&'a self, id: u64) -> BoxFuture<'a, Result<(), StoreError>>;

    fn save_event<'a>(&'a self, event: ParsedEvent) -> BoxFuture<'a, Result<ParsedEvent, StoreError>>;

    fn save_recommendations<'a>(
        &'a self,
        recommendations: Vec<Recommendation>,
    ) -> BoxFuture<'a, Result<Vec<Recommendation>, StoreError>>;

    /// Error-level events with an originating server, at or after `since`
    fn recent_errors<'a>(
        &'a self,
        since: Timestamp,
    ) -> BoxFuture<'a, Result<Vec<ParsedEvent>, StoreError>>;

    /// Forget records that fell out of the retention window ending at `cutoff`
    ///
    /// Returns the number of records dropped. Stores with their own retention
    /// keep this default, which drops nothing.
    fn prune<'a>(&'a self, cutoff: Timestamp) -> BoxFuture<'a, Result<usize, StoreError>> {
        let _ = cutoff;
        Box::pin(async { Ok(0) })
    }
}

/// Server directory backed by the configuration file
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    servers: RwLock<HashMap<ServerId, ServerConfig>>,
}

impl InMemoryDirectory {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers: RwLock::new(servers.into_iter().map(|s| (s.id, s)).collect()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.servers.clone())
    }

    pub fn status(&self, id: ServerId) -> Option<ServerStatus> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|server| server.status)
    }

    pub fn remove(&self, id: ServerId) -> Option<ServerConfig> {
        self.servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }
}

impl ServerDirectory for InMemoryDirectory {
    fn server(&self, id: ServerId) -> Option<ServerConfig> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self
            .servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn set_status(&self, id: ServerId, status: ServerStatus) -> Result<(), StoreError> {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        let server = servers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("server {}", id)))?;
        if server.status != status {
            debug!("Server {} status {:?} -> {:?}", id, server.status, status);
        }
        server.status = status;
        Ok(())
    }
}

/// A record and when it entered the store
#[derive(Debug)]
struct Stored<T> {
    stored_at: Timestamp,
    record: T,
}

impl<T> Stored<T> {
    fn now(record: T) -> Self {
        Self {
            stored_at: Utc::now(),
            record,
        }
    }
}

#[derive(Debug, Default)]
struct Records {
    artifacts: Vec<Stored<RawArtifact>>,
    events: Vec<Stored<ParsedEvent>>,
    recommendations: Vec<Stored<Recommendation>>,
    next_id: u64,
}

impl Records {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Event store kept in process memory
///
/// Nothing is dropped until [`EventStore::prune`] runs; the threshold monitor
/// prunes once per cycle with its window start as the cutoff.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    records: Mutex<Records>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<RawArtifact> {
        Self::records_of(&self.lock().artifacts)
    }

    pub fn events(&self) -> Vec<ParsedEvent> {
        Self::records_of(&self.lock().events)
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        Self::records_of(&self.lock().recommendations)
    }

    /// Insert an already-built event, as an external writer would
    pub fn insert_event(&self, event: ParsedEvent) -> ParsedEvent {
        self.insert_event_at(event, Utc::now())
    }

    /// Insert an event as if it had been stored at `stored_at`
    pub fn insert_event_at(&self, mut event: ParsedEvent, stored_at: Timestamp) -> ParsedEvent {
        let mut records = self.lock();
        event.id = Some(records.next_id());
        records.events.push(Stored {
            stored_at,
            record: event.clone(),
        });
        event
    }

    /// Drop events and recommendations stored before `cutoff`, and artifacts
    /// too; analyzed artifacts lose their bytes right away
    ///
    /// Events whose own timestamp is still inside the window are kept.
    pub fn prune_before(&self, cutoff: Timestamp) -> usize {
        let mut records = self.lock();
        let before = records.artifacts.len() + records.events.len() + records.recommendations.len();

        records.events.retain(|stored| {
            let newest = stored
                .record
                .timestamp
                .map_or(stored.stored_at, |ts| ts.max(stored.stored_at));
            newest >= cutoff
        });
        records
            .recommendations
            .retain(|stored| stored.stored_at >= cutoff);
        records.artifacts.retain(|stored| stored.stored_at >= cutoff);
        for stored in records.artifacts.iter_mut() {
            if stored.record.status == ArtifactStatus::Analyzed && !stored.record.data.is_empty() {
                stored.record.data = Vec::new();
            }
        }

        let after = records.artifacts.len() + records.events.len() + records.recommendations.len();
        let dropped = before - after;
        if dropped > 0 {
            debug!("Pruned {} record(s) stored before {}", dropped, cutoff);
        }
        dropped
    }

    fn records_of<T: Clone>(stored: &[Stored<T>]) -> Vec<T> {
        stored.iter().map(|stored| stored.record.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventStore for InMemoryEventStore {
    fn save_artifact<'a>(
        &'a self,
        mut artifact: RawArtifact,
    ) -> BoxFuture<'a, Result<RawArtifact, StoreError>> {
        Box::pin(async move {
            let mut records = self.lock();
            artifact.id = Some(records.next_id());
            records.artifacts.push(Stored::now(artifact.clone()));
            Ok(artifact)
        })
    }

    fn mark_artifact_analyzed<'a>(&'a self, id: u64) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut records = self.lock();
            let stored = records
                .artifacts
                .iter_mut()
                .find(|stored| stored.record.id == Some(id))
                .ok_or_else(|| StoreError::NotFound(format!("artifact {}", id)))?;
            stored.record.status = ArtifactStatus::Analyzed;
            Ok(())
        })
    }

    fn save_event<'a>(
        &'a self,
        event: ParsedEvent,
    ) -> BoxFuture<'a, Result<ParsedEvent, StoreError>> {
        Box::pin(async move { Ok(self.insert_event(event)) })
    }

    fn save_recommendations<'a>(
        &'a self,
        recommendations: Vec<Recommendation>,
    ) -> BoxFuture<'a, Result<Vec<Recommendation>, StoreError>> {
        Box::pin(async move {
            let mut records = self.lock();
            let mut saved = Vec::with_capacity(recommendations.len());
            for mut recommendation in recommendations {
                recommendation.id = Some(records.next_id());
                records
                    .recommendations
                    .push(Stored::now(recommendation.clone()));
                saved.push(recommendation);
            }
            Ok(saved)
        })
    }

    fn recent_errors<'a>(
        &'a self,
        since: Timestamp,
    ) -> BoxFuture<'a, Result<Vec<ParsedEvent>, StoreError>> {
        Box::pin(async move {
            let records = self.lock();
            Ok(records
                .events
                .iter()
                .map(|stored| &stored.record)
                .filter(|event| {
                    event.is_error()
                        && event.server_id.is_some()
                        && event.timestamp.is_some_and(|ts| ts >= since)
                })
                .cloned()
                .collect())
        })
    }

    fn prune<'a>(&'a self, cutoff: Timestamp) -> BoxFuture<'a, Result<usize, StoreError>> {
        Box::pin(async move { Ok(self.prune_before(cutoff)) })
    }
}
