//! Session-bound storage
//!
//! Correlation state lives in the browser session between the redirect to the
//! provider and the callback. The engine only needs a small key/value contract
//! from the hosting application ([`SessionStore`]); [`InMemorySessionStore`]
//! is a complete implementation for single-node deployments and tests.

use crate::context::RequestContext;
use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Maximum age of a correlation before the callback is refused (10 minutes).
pub const CORRELATION_TTL_SECS: i64 = 600;

/// Session key/value storage scoped to the current browser session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read a value from the current session.
    async fn get(&self, ctx: &RequestContext, key: &str) -> AuthResult<Option<String>>;

    /// Write a value into the current session.
    async fn set(&self, ctx: &RequestContext, key: &str, value: String) -> AuthResult<()>;

    /// Remove a value, returning what was stored.
    async fn remove(&self, ctx: &RequestContext, key: &str) -> AuthResult<Option<String>>;

    /// Destroy the current session.
    async fn destroy(&self, ctx: &RequestContext) -> AuthResult<()>;

    /// Move the current session to a fresh identifier.
    ///
    /// Implementations update `ctx.session_id` so the adapter can reissue the
    /// session cookie.
    async fn renew(&self, ctx: &mut RequestContext) -> AuthResult<()>;

    /// Destroy a session that is not the one bound to the current request.
    ///
    /// Used for back-channel logout. Returns false when the session is
    /// unknown.
    async fn destroy_by_id(&self, session_id: &str) -> AuthResult<bool>;
}

/// In-memory session store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, HashMap<String, String>>>>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the store holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Whether a session with this identifier exists.
    pub async fn exists(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, ctx: &RequestContext, key: &str) -> AuthResult<Option<String>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&ctx.session_id)
            .and_then(|values| values.get(key))
            .cloned())
    }

    async fn set(&self, ctx: &RequestContext, key: &str, value: String) -> AuthResult<()> {
        if ctx.session_id.is_empty() {
            return Err(AuthError::Session("request has no session".to_string()));
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(ctx.session_id.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, ctx: &RequestContext, key: &str) -> AuthResult<Option<String>> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .get_mut(&ctx.session_id)
            .and_then(|values| values.remove(key)))
    }

    async fn destroy(&self, ctx: &RequestContext) -> AuthResult<()> {
        self.sessions.write().await.remove(&ctx.session_id);
        Ok(())
    }

    async fn renew(&self, ctx: &mut RequestContext) -> AuthResult<()> {
        let new_id = Uuid::now_v7().to_string();

        let mut sessions = self.sessions.write().await;
        let values = sessions.remove(&ctx.session_id).unwrap_or_default();
        sessions.insert(new_id.clone(), values);

        tracing::debug!(old = %ctx.session_id, new = %new_id, "Session renewed");
        ctx.session_id = new_id;
        Ok(())
    }

    async fn destroy_by_id(&self, session_id: &str) -> AuthResult<bool> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }
}

/// Names of the session keys a client writes.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    client_name: String,
}

impl SessionKeys {
    /// Keys for the given client.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    /// Key of the serialized [`CorrelationState`].
    pub fn correlation(&self) -> String {
        format!("{}$correlation", self.client_name)
    }

    /// Key of the pending SP-initiated logout request ID.
    pub fn logout_request_id(&self) -> String {
        format!("{}$logoutRequestId", self.client_name)
    }
}

/// Values generated before a redirect and matched on the callback.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelationState {
    /// CSRF state / SAML RelayState
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// OIDC nonce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// PKCE code verifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce_verifier: Option<String>,

    /// SAML AuthnRequest ID, matched against `InResponseTo`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Creation time (Unix seconds)
    pub created_at: i64,
}

impl CorrelationState {
    /// Create an empty correlation stamped with the current time.
    pub fn new() -> Self {
        Self {
            created_at: Utc::now().timestamp(),
            ..Default::default()
        }
    }

    /// Check if the correlation is older than [`CORRELATION_TTL_SECS`].
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against a given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() - self.created_at > CORRELATION_TTL_SECS
    }

    /// Store this correlation in the session, replacing any earlier attempt.
    pub async fn save(
        &self,
        store: &dyn SessionStore,
        ctx: &RequestContext,
        keys: &SessionKeys,
    ) -> AuthResult<()> {
        let value = serde_json::to_string(self)
            .map_err(|e| AuthError::Internal(format!("Failed to serialize correlation: {}", e)))?;
        store.set(ctx, &keys.correlation(), value).await
    }

    /// Read and remove the correlation stored for this client.
    ///
    /// A stored correlation is usable once. An expired one is discarded and
    /// reported as a state mismatch.
    pub async fn take(
        store: &dyn SessionStore,
        ctx: &RequestContext,
        keys: &SessionKeys,
    ) -> AuthResult<Option<Self>> {
        let Some(raw) = store.remove(ctx, &keys.correlation()).await? else {
            return Ok(None);
        };

        let correlation: CorrelationState = serde_json::from_str(&raw).map_err(|e| {
            AuthError::StateMismatch(format!("unreadable correlation in session: {}", e))
        })?;

        if correlation.is_expired() {
            return Err(AuthError::StateMismatch(
                "login attempt expired".to_string(),
            ));
        }

        Ok(Some(correlation))
    }
}

/// Compare a session-stored value against the one presented by the callback.
///
/// Missing values on either side fail. Comparison is exact over the bytes.
pub fn verify_correlation_value(
    name: &str,
    expected: Option<&str>,
    presented: Option<&str>,
) -> AuthResult<()> {
    match (expected, presented) {
        (Some(expected), Some(presented)) if expected.as_bytes() == presented.as_bytes() => Ok(()),
        (None, _) => Err(AuthError::StateMismatch(format!(
            "no {} stored in session",
            name
        ))),
        (Some(_), None) => Err(AuthError::StateMismatch(format!(
            "{} missing from callback",
            name
        ))),
        (Some(_), Some(_)) => Err(AuthError::StateMismatch(format!(
            "{} does not match session",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(session: &str) -> RequestContext {
        RequestContext::get("https://app.example.com/", session)
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = InMemorySessionStore::new();
        store.set(&ctx("a"), "k", "1".to_string()).await.unwrap();

        assert_eq!(store.get(&ctx("a"), "k").await.unwrap().as_deref(), Some("1"));
        assert!(store.get(&ctx("b"), "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_moves_values() {
        let store = InMemorySessionStore::new();
        let mut request = ctx("old");
        store.set(&request, "k", "v".to_string()).await.unwrap();

        store.renew(&mut request).await.unwrap();

        assert_ne!(request.session_id, "old");
        assert!(!store.exists("old").await);
        assert_eq!(store.get(&request, "k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_destroy_by_id() {
        let store = InMemorySessionStore::new();
        store.set(&ctx("a"), "k", "v".to_string()).await.unwrap();

        assert!(store.destroy_by_id("a").await.unwrap());
        assert!(!store.destroy_by_id("a").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_correlation_is_single_use() {
        let store = InMemorySessionStore::new();
        let keys = SessionKeys::new("okta");
        let request = ctx("a");

        let correlation = CorrelationState {
            state: Some("s1".to_string()),
            ..CorrelationState::new()
        };
        correlation.save(&store, &request, &keys).await.unwrap();

        let taken = CorrelationState::take(&store, &request, &keys).await.unwrap();
        assert_eq!(taken, Some(correlation));
        assert!(CorrelationState::take(&store, &request, &keys)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_correlation_rejected() {
        let store = InMemorySessionStore::new();
        let keys = SessionKeys::new("okta");
        let request = ctx("a");

        let correlation = CorrelationState {
            state: Some("s1".to_string()),
            created_at: Utc::now().timestamp() - CORRELATION_TTL_SECS - 1,
            ..Default::default()
        };
        correlation.save(&store, &request, &keys).await.unwrap();

        let result = CorrelationState::take(&store, &request, &keys).await;
        assert!(matches!(result, Err(AuthError::StateMismatch(_))));
    }

    #[test]
    fn test_session_key_names() {
        let keys = SessionKeys::new("c1");
        assert_eq!(keys.correlation(), "c1$correlation");
        assert_eq!(keys.logout_request_id(), "c1$logoutRequestId");
    }

    #[test]
    fn test_verify_correlation_value() {
        assert!(verify_correlation_value("state", Some("s1"), Some("s1")).is_ok());
        assert!(verify_correlation_value("state", Some("s1"), Some("s2")).is_err());
        assert!(verify_correlation_value("state", Some("s1"), Some("s1x")).is_err());
        assert!(verify_correlation_value("state", Some("s1"), None).is_err());
        assert!(verify_correlation_value("state", None, Some("s1")).is_err());
    }
}
