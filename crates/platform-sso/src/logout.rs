//! Logout handling
//!
//! Provider-initiated logout arrives either through the user's browser
//! (front-channel) or server to server (back-channel). In both cases the
//! notification names a provider session key, never the local session. The
//! [`LogoutHandler`] keeps the mapping between the two, recorded at login.

use crate::context::{RedirectInstruction, RequestContext};
use crate::error::AuthResult;
use crate::session::SessionStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result of processing a logout notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// Nothing to send beyond an empty 200
    Acknowledged,

    /// Send the browser on (post-logout page, or a SAML LogoutResponse)
    Redirect(RedirectInstruction),

    /// SOAP envelope to return as the response body
    SoapResponse(String),
}

/// Session tracking and destruction for provider-initiated logout.
#[async_trait]
pub trait LogoutHandler: Send + Sync {
    /// Remember that `key` belongs to the current session.
    async fn record_session(&self, ctx: &RequestContext, key: &str) -> AuthResult<()>;

    /// Front-channel: destroy the current session if it is the one `key`
    /// was recorded for.
    async fn destroy_session_front(
        &self,
        ctx: &RequestContext,
        sessions: &dyn SessionStore,
        key: &str,
    ) -> AuthResult<bool>;

    /// Back-channel: destroy whatever session `key` was recorded for.
    async fn destroy_session_back(&self, sessions: &dyn SessionStore, key: &str)
        -> AuthResult<bool>;
}

/// Keeps the key to session mapping in memory.
#[derive(Debug, Clone, Default)]
pub struct DefaultLogoutHandler {
    tracked: Arc<RwLock<HashMap<String, String>>>,
}

impl DefaultLogoutHandler {
    /// Create a handler with no tracked sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Session identifier recorded for a key.
    pub async fn tracked_session(&self, key: &str) -> Option<String> {
        self.tracked.read().await.get(key).cloned()
    }

    async fn forget_session(&self, session_id: &str) {
        self.tracked.write().await.retain(|_, id| id != session_id);
    }
}

#[async_trait]
impl LogoutHandler for DefaultLogoutHandler {
    async fn record_session(&self, ctx: &RequestContext, key: &str) -> AuthResult<()> {
        if key.is_empty() {
            return Ok(());
        }

        self.tracked
            .write()
            .await
            .insert(key.to_string(), ctx.session_id.clone());
        tracing::debug!(key = %key, session = %ctx.session_id, "Tracking session for logout");
        Ok(())
    }

    async fn destroy_session_front(
        &self,
        ctx: &RequestContext,
        sessions: &dyn SessionStore,
        key: &str,
    ) -> AuthResult<bool> {
        let tracked = self.tracked_session(key).await;

        match tracked {
            Some(session_id) if session_id == ctx.session_id => {
                sessions.destroy(ctx).await?;
                self.forget_session(&session_id).await;
                tracing::info!(key = %key, "Session destroyed by front-channel logout");
                Ok(true)
            }
            Some(_) => {
                tracing::warn!(
                    key = %key,
                    "Front-channel logout for a session other than the current one; ignored"
                );
                Ok(false)
            }
            None => {
                tracing::debug!(key = %key, "Front-channel logout for an unknown session");
                Ok(false)
            }
        }
    }

    async fn destroy_session_back(
        &self,
        sessions: &dyn SessionStore,
        key: &str,
    ) -> AuthResult<bool> {
        let Some(session_id) = self.tracked_session(key).await else {
            tracing::debug!(key = %key, "Back-channel logout for an unknown session");
            return Ok(false);
        };

        let destroyed = sessions.destroy_by_id(&session_id).await?;
        self.forget_session(&session_id).await;

        if destroyed {
            tracing::info!(key = %key, "Session destroyed by back-channel logout");
        }
        Ok(destroyed)
    }
}
