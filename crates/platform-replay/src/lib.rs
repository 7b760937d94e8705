//! # Platform Replay
//!
//! This crate provides the replay-protection cache shared by the Relay
//! platform single sign-on clients.
//!
//! ## Overview
//!
//! Identity providers hand out single-use evidence: SAML assertion IDs,
//! logout message IDs, OIDC logout token `jti` values and CAS service tickets.
//! The platform-replay crate records every identifier that has been accepted
//! until its validity window closes, so that a second presentation of the same
//! identifier is rejected even when both arrive at the same time.
//!
//! ## Features
//!
//! - `memory` (default): In-process cache for single-instance deployments
//! - `redis`: Redis-backed cache using atomic `SET NX PX` for clusters
//!
//! ## Usage
//!
//! ```rust,no_run
//! use platform_replay::{MemoryReplayCache, ReplayCache};
//! use chrono::{Duration, Utc};
//!
//! async fn example() {
//!     let cache = MemoryReplayCache::new();
//!     let expires_at = Utc::now() + Duration::minutes(5);
//!
//!     // First use is recorded
//!     assert!(cache.check_and_insert("saml2:_a1b2c3", expires_at).await.unwrap());
//!
//!     // Second use is reported as a replay
//!     assert!(!cache.check_and_insert("saml2:_a1b2c3", expires_at).await.unwrap());
//! }
//! ```

pub mod cache;

#[cfg(feature = "redis")]
pub mod redis;

// Re-export main types
pub use cache::{MemoryReplayCache, ReplayCache, ReplayCacheStats, ReplayError, ReplayResult};

#[cfg(feature = "redis")]
pub use redis::RedisReplayCache;
