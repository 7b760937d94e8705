//! Redis-backed replay cache for distributed deployments.
//!
//! Every application instance behind a load balancer must see the same set
//! of consumed identifiers, otherwise a replayed assertion only has to land
//! on a different node. This backend stores one key per identifier with a
//! Redis-side expiry and relies on `SET ... NX` for atomicity.

use crate::cache::{ReplayCache, ReplayCacheStats, ReplayError, ReplayResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Redis-backed replay cache.
///
/// # Example
///
/// ```rust,no_run
/// use platform_replay::RedisReplayCache;
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let cache = RedisReplayCache::new("redis://localhost:6379", "relay").await?;
///     Ok(())
/// }
/// ```
pub struct RedisReplayCache {
    /// Redis client
    client: Client,

    /// Key prefix for all Redis operations
    prefix: String,

    /// Local counters (per process)
    stats: Arc<RwLock<ReplayCacheStats>>,
}

impl RedisReplayCache {
    /// Create a new Redis replay cache.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., `redis://localhost:6379`)
    /// * `prefix` - Key prefix for Redis operations (e.g., `relay`)
    pub async fn new(redis_url: &str, prefix: &str) -> ReplayResult<Self> {
        let client =
            Client::open(redis_url).map_err(|e| ReplayError::ConnectionError(e.to_string()))?;

        // Test connection
        let _ = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ReplayError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
            stats: Arc::new(RwLock::new(ReplayCacheStats::default())),
        })
    }

    async fn get_connection(&self) -> ReplayResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ReplayError::ConnectionError(e.to_string()))
    }

    fn key(&self, id: &str) -> String {
        format!("{}:replay:{}", self.prefix, id)
    }
}

#[async_trait]
impl ReplayCache for RedisReplayCache {
    async fn check_and_insert(&self, id: &str, expires_at: DateTime<Utc>) -> ReplayResult<bool> {
        if id.is_empty() {
            return Err(ReplayError::InvalidKey("empty identifier".to_string()));
        }

        // PX must be positive; an already-expired record still blocks for 1ms.
        let ttl_ms = (expires_at - Utc::now()).num_milliseconds().max(1);

        let mut conn = self.get_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(id))
            .arg(expires_at.timestamp())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplayError::StoreError(e.to_string()))?;

        let inserted = reply.is_some();

        let mut stats = self.stats.write().await;
        if inserted {
            stats.recorded += 1;
        } else {
            stats.rejected += 1;
            tracing::debug!(id = %id, "Replay cache hit in Redis");
        }

        Ok(inserted)
    }

    async fn contains(&self, id: &str) -> ReplayResult<bool> {
        let mut conn = self.get_connection().await?;
        conn.exists::<_, bool>(self.key(id))
            .await
            .map_err(|e| ReplayError::StoreError(e.to_string()))
    }

    /// Redis expires keys on its own; nothing to purge locally.
    async fn purge_expired(&self) -> ReplayResult<usize> {
        Ok(0)
    }

    async fn stats(&self) -> ReplayCacheStats {
        self.stats.read().await.clone()
    }
}
