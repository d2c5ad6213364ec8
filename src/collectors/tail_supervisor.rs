//! Lifecycle of the file followers
//!
//! The supervisor owns one follower task per (server, path). Starting a server
//! replaces any follower already registered for the same path; stopping cancels
//! them all. Start and stop of one server are serialized. A follower that gives
//! up on its file deregisters itself.

use crate::aggregator::ChunkAccumulator;
use crate::collectors::follower::{FollowOutcome, Follower};
use crate::config::TailingConfig;
use crate::error::TailError;
use crate::events::{ServerId, ServerStatus};
use crate::storage::ServerDirectory;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type FollowerKey = (ServerId, PathBuf);

/// Registry entry for a running follower task
struct ActiveFollower {
    /// Distinguishes successive followers of the same path
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts, stops and reports on the followers of every server
pub struct TailSupervisor {
    directory: Arc<dyn ServerDirectory>,
    accumulator: Arc<ChunkAccumulator>,
    followers: Arc<DashMap<FollowerKey, ActiveFollower>>,
    /// Held across a whole start or stop of one server
    server_locks: DashMap<ServerId, Arc<Mutex<()>>>,
    tailing: TailingConfig,
    next_generation: AtomicU64,
    /// Parent of every follower token
    root: CancellationToken,
}

impl TailSupervisor {
    pub fn new(
        directory: Arc<dyn ServerDirectory>,
        accumulator: Arc<ChunkAccumulator>,
        tailing: TailingConfig,
    ) -> Self {
        Self {
            directory,
            accumulator,
            followers: Arc::new(DashMap::new()),
            server_locks: DashMap::new(),
            tailing,
            next_generation: AtomicU64::new(1),
            root: CancellationToken::new(),
        }
    }

    /// Derive follower tokens from `root` so cancelling it stops every follower
    pub fn with_root_token(mut self, root: CancellationToken) -> Self {
        self.root = root;
        self
    }

    /// Start following the log files of a server
    ///
    /// Missing or unreadable paths are skipped and mark the server `Stopped`.
    /// A path that already has a follower gets a fresh one.
    ///
    /// # Returns
    ///
    /// The number of followers started
    ///
    /// # Errors
    ///
    /// Returns `TailError::UnknownServer` if the directory does not know the server
    pub async fn start(&self, server_id: ServerId) -> Result<usize, TailError> {
        let server = self
            .directory
            .server(server_id)
            .ok_or(TailError::UnknownServer(server_id))?;

        let lock = self.server_lock(server_id);
        let _guard = lock.lock().await;

        let default_poll = Duration::from_millis(self.tailing.default_poll_interval_ms);
        let mut started = 0;

        for path in server.watch_paths() {
            if let Err(e) = Self::check_readable(&path).await {
                warn!(
                    "Cannot follow {} for server {}: {}",
                    path.display(),
                    server_id,
                    e
                );
                self.update_status(server_id, ServerStatus::Stopped);
                continue;
            }

            let key = (server_id, path.clone());
            if let Some((_, previous)) = self.followers.remove(&key) {
                info!(
                    "Replacing follower of {} for server {}",
                    path.display(),
                    server_id
                );
                Self::shut_down(previous).await;
            }

            let target = server.watch_target(path, default_poll);
            let follower = Follower::new(target, self.accumulator.clone());
            if let Some(displaced) = self.spawn_follower(key, follower) {
                warn!(
                    "Follower of generation {} was still registered for server {}",
                    displaced.generation, server_id
                );
                Self::shut_down(displaced).await;
            }
            started += 1;
        }

        if started > 0 {
            self.update_status(server_id, ServerStatus::Running);
            info!("Started {} follower(s) for server {}", started, server_id);
        } else {
            warn!("No readable log file for server {}", server_id);
        }
        Ok(started)
    }

    /// Cancel every follower of a server and mark it `Stopped`
    ///
    /// Stopping a server without followers does nothing.
    pub async fn stop(&self, server_id: ServerId) {
        if self.stop_followers(server_id).await == 0 {
            info!("Server {} has no active follower", server_id);
        } else {
            info!("Stopped tailing server {}", server_id);
        }
    }

    /// Cancel every follower of every server
    pub async fn stop_all(&self) {
        let mut server_ids: Vec<ServerId> = self.followers.iter().map(|e| e.key().0).collect();
        server_ids.sort_unstable();
        server_ids.dedup();

        let mut stopped = 0;
        for server_id in server_ids {
            if self.stop_followers(server_id).await > 0 {
                stopped += 1;
            }
        }
        info!("Stopped all followers ({} server(s))", stopped);
    }

    /// Whether at least one follower is registered for the server
    pub fn status(&self, server_id: ServerId) -> bool {
        self.followers.iter().any(|e| e.key().0 == server_id)
    }

    /// Tailing state of every server the directory knows
    pub fn status_all(&self) -> HashMap<ServerId, bool> {
        self.directory
            .server_ids()
            .into_iter()
            .map(|id| (id, self.status(id)))
            .collect()
    }

    /// Number of registered followers
    pub fn active_followers(&self) -> usize {
        self.followers.len()
    }

    async fn check_readable(path: &Path) -> Result<(), TailError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(TailError::Unreadable(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        tokio::fs::File::open(path).await?;
        Ok(())
    }

    /// Cancel and deregister the followers of one server, returning how many
    async fn stop_followers(&self, server_id: ServerId) -> usize {
        let lock = self.server_lock(server_id);
        let _guard = lock.lock().await;

        let mut stopped = 0;
        for key in self.keys_of(server_id) {
            if let Some((_, active)) = self.followers.remove(&key) {
                Self::shut_down(active).await;
                stopped += 1;
            }
        }
        if stopped > 0 {
            self.update_status(server_id, ServerStatus::Stopped);
        }
        stopped
    }

    fn server_lock(&self, server_id: ServerId) -> Arc<Mutex<()>> {
        self.server_locks
            .entry(server_id)
            .or_default()
            .value()
            .clone()
    }

    /// Register and spawn a follower, returning the entry it displaced
    fn spawn_follower(&self, key: FollowerKey, follower: Follower) -> Option<ActiveFollower> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        let follower = follower
            .with_max_consecutive_misses(self.tailing.max_consecutive_misses)
            .with_read_from_start(self.tailing.read_from_start);

        let followers = self.followers.clone();
        let directory = self.directory.clone();
        let task_key = key.clone();
        let task_token = token.clone();

        // The entry guard is held until the follower is registered, so a
        // follower that gives up at once still finds its own entry to remove
        let entry = self.followers.entry(key);
        let handle = tokio::spawn(async move {
            if follower.run(task_token).await == FollowOutcome::GaveUp {
                let (server_id, path) = &task_key;
                // A newer follower for the same path keeps its registration
                followers.remove_if(&task_key, |_, active| active.generation == generation);
                let remaining = followers.iter().any(|e| e.key().0 == *server_id);
                debug!(
                    "Follower of {} deregistered, server {} has followers left: {}",
                    path.display(),
                    server_id,
                    remaining
                );
                if !remaining {
                    if let Err(e) = directory.set_status(*server_id, ServerStatus::Stopped) {
                        warn!("Failed to mark server {} stopped: {}", server_id, e);
                    }
                }
            }
        });

        let active = ActiveFollower {
            generation,
            token,
            handle,
        };
        match entry {
            Entry::Occupied(mut occupied) => Some(occupied.insert(active)),
            Entry::Vacant(vacant) => {
                vacant.insert(active);
                None
            }
        }
    }

    async fn shut_down(active: ActiveFollower) {
        active.token.cancel();
        if let Err(e) = active.handle.await {
            warn!("Follower task ended abnormally: {}", e);
        }
    }

    fn keys_of(&self, server_id: ServerId) -> Vec<FollowerKey> {
        self.followers
            .iter()
            .filter(|e| e.key().0 == server_id)
            .map(|e| e.key().clone())
            .collect()
    }

    fn update_status(&self, server_id: ServerId, status: ServerStatus) {
        if let Err(e) = self.directory.set_status(server_id, status) {
            warn!(
                "Failed to set status of server {} to {:?}: {}",
                server_id, status, e
            );
        }
    }
}
