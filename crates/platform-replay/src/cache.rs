//! Replay cache implementation
//!
//! This module provides the replay cache abstraction and the in-memory
//! implementation used by single-process deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Replay cache error types.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Connection to the backing store failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The backing store rejected a command
    #[error("Store error: {0}")]
    StoreError(String),

    /// The identifier cannot be used as a cache key
    #[error("Invalid message identifier: {0}")]
    InvalidKey(String),
}

/// Result type for replay cache operations.
pub type ReplayResult<T> = Result<T, ReplayError>;

/// Replay cache trait for recording consumed message identifiers.
///
/// `check_and_insert` must be atomic: when two callers race with the same
/// identifier, exactly one of them observes `true`.
#[async_trait]
pub trait ReplayCache: Send + Sync {
    /// Record an identifier until `expires_at`.
    ///
    /// Returns `true` when the identifier was not present (or its previous
    /// record had expired) and is now recorded, `false` when it is a replay.
    async fn check_and_insert(&self, id: &str, expires_at: DateTime<Utc>) -> ReplayResult<bool>;

    /// Check whether an identifier is currently recorded.
    async fn contains(&self, id: &str) -> ReplayResult<bool>;

    /// Drop every record whose expiry has passed.
    ///
    /// Returns the number of records removed.
    async fn purge_expired(&self) -> ReplayResult<usize>;

    /// Get replay cache stats.
    async fn stats(&self) -> ReplayCacheStats;
}

/// Replay cache statistics.
#[derive(Debug, Clone, Default)]
pub struct ReplayCacheStats {
    /// Identifiers recorded
    pub recorded: u64,
    /// Replays rejected
    pub rejected: u64,
    /// Expired records purged
    pub purged: u64,
    /// Records currently held
    pub entries: usize,
}

/// Default number of inserts between opportunistic sweeps.
const DEFAULT_SWEEP_INTERVAL: u64 = 256;

/// In-memory replay cache implementation.
///
/// Records live in a single map guarded by a write lock, which makes the
/// check and the insert one critical section. Expired records are swept
/// every `sweep_interval` inserts so the map stays bounded without a
/// background task.
pub struct MemoryReplayCache {
    /// Identifier -> expiry
    entries: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    /// Statistics
    stats: Arc<RwLock<ReplayCacheStats>>,
    /// Inserts between sweeps
    sweep_interval: u64,
}

impl std::fmt::Debug for MemoryReplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReplayCache")
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl MemoryReplayCache {
    /// Create a new in-memory replay cache.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create with a custom sweep interval (minimum 1).
    pub fn with_sweep_interval(sweep_interval: u64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ReplayCacheStats::default())),
            sweep_interval: sweep_interval.max(1),
        }
    }

    fn sweep(entries: &mut HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) -> usize {
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }
}

impl Default for MemoryReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplayCache for MemoryReplayCache {
    async fn check_and_insert(&self, id: &str, expires_at: DateTime<Utc>) -> ReplayResult<bool> {
        if id.is_empty() {
            return Err(ReplayError::InvalidKey("empty identifier".to_string()));
        }

        let now = Utc::now();
        let mut entries = self.entries.write().await;

        let live = entries.get(id).is_some_and(|existing| *existing > now);
        if live {
            drop(entries);
            let mut stats = self.stats.write().await;
            stats.rejected += 1;
            tracing::debug!(id = %id, "Replay cache hit");
            return Ok(false);
        }

        entries.insert(id.to_string(), expires_at);

        let mut stats = self.stats.write().await;
        stats.recorded += 1;
        if stats.recorded % self.sweep_interval == 0 {
            let purged = Self::sweep(&mut entries, now);
            stats.purged += purged as u64;
            if purged > 0 {
                tracing::debug!(purged = purged, "Swept expired replay records");
            }
        }
        stats.entries = entries.len();

        Ok(true)
    }

    async fn contains(&self, id: &str) -> ReplayResult<bool> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(id)
            .is_some_and(|expires_at| *expires_at > Utc::now()))
    }

    async fn purge_expired(&self) -> ReplayResult<usize> {
        let mut entries = self.entries.write().await;
        let purged = Self::sweep(&mut entries, Utc::now());

        let mut stats = self.stats.write().await;
        stats.purged += purged as u64;
        stats.entries = entries.len();

        Ok(purged)
    }

    async fn stats(&self) -> ReplayCacheStats {
        self.stats.read().await.clone()
    }
}
