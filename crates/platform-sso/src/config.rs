//! Shared configuration.
//!
//! Protocol specific settings live next to their clients
//! ([`crate::oidc::OidcClientConfig`], [`crate::saml::Saml2ClientConfig`],
//! [`crate::cas::CasClientConfig`]). This module holds the pieces every client
//! shares: outbound HTTP timeouts and pipeline-level switches. Nothing here is
//! global; each value is handed to the component that needs it.

use crate::error::{AuthError, AuthResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts for calls to identity provider back-channels.
///
/// Both values are bounded: an unbounded token endpoint call ties up a
/// request worker for as long as the provider chooses to stall.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpClientConfig {
    /// TCP/TLS connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Total request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_timeout() -> u64 {
    10
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            timeout_secs: default_timeout(),
        }
    }
}

impl HttpClientConfig {
    /// Load timeouts from environment variables.
    ///
    /// Environment variables:
    /// - `SSO_HTTP_CONNECT_TIMEOUT_SECS`: connect timeout (default: 5)
    /// - `SSO_HTTP_TIMEOUT_SECS`: total request timeout (default: 10)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            connect_timeout_secs: std::env::var("SSO_HTTP_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.connect_timeout_secs),
            timeout_secs: std::env::var("SSO_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.timeout_secs),
        }
    }

    /// Connect timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Build an HTTP client honouring both timeouts.
    pub fn build_client(&self) -> AuthResult<reqwest::Client> {
        if self.connect_timeout_secs == 0 || self.timeout_secs == 0 {
            return Err(AuthError::Configuration(
                "HTTP timeouts must be greater than zero".to_string(),
            ));
        }

        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout())
            .timeout(self.timeout())
            .build()
            .map_err(|e| AuthError::Configuration(format!("Failed to build HTTP client: {}", e)))
    }
}

/// Pipeline-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Client name; prefixes every session key this pipeline writes.
    pub client_name: String,

    /// Issue a fresh session identifier after a successful login.
    #[serde(default = "default_true")]
    pub renew_session_on_login: bool,

    /// Track provider session keys so logout notifications can find the
    /// local session.
    #[serde(default = "default_true")]
    pub track_sessions: bool,
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    /// Create a configuration for the given client name.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            renew_session_on_login: true,
            track_sessions: true,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> AuthResult<()> {
        if self.client_name.trim().is_empty() {
            return Err(AuthError::Configuration(
                "client name must not be empty".to_string(),
            ));
        }
        if self.client_name.contains('$') {
            return Err(AuthError::Configuration(
                "client name must not contain '$'".to_string(),
            ));
        }
        Ok(())
    }
}
