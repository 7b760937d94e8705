//! OIDC client configuration.

use crate::config::HttpClientConfig;
use crate::error::{AuthError, AuthResult};
use crate::jose::JwsAlgorithm;
use crate::oidc::exchange::ClientAuthMethod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// When to send a PKCE challenge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PkceMode {
    /// Only if the provider advertises a supported method
    #[default]
    Auto,
    /// Never
    Disabled,
    /// Always; S256 unless the provider only advertises `plain`
    Required,
}

/// OIDC relying party configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct OidcClientConfig {
    /// Client identifier registered with the provider
    pub client_id: String,

    /// Client secret (confidential clients, HMAC ID tokens)
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Callback URL registered with the provider
    pub redirect_uri: String,

    /// Requested scopes, space separated
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Only `code` is supported
    #[serde(default = "default_response_type")]
    pub response_type: String,

    /// Restrict ID token signatures to this algorithm
    #[serde(default)]
    pub preferred_jws_algorithm: Option<JwsAlgorithm>,

    /// Accept `alg: none` ID tokens. Never enable against a production provider.
    #[serde(default)]
    pub allow_unsigned_id_tokens: bool,

    /// Token endpoint authentication method; negotiated when absent
    #[serde(default)]
    pub client_auth_method: Option<ClientAuthMethod>,

    /// PEM private key for `private_key_jwt`
    #[serde(default)]
    pub private_key_pem: Option<String>,

    /// Signing algorithm for `private_key_jwt` (default RS256)
    #[serde(default)]
    pub private_key_algorithm: Option<JwsAlgorithm>,

    /// Send and check `state`
    #[serde(default = "default_true")]
    pub use_state: bool,

    /// Send and check `nonce`
    #[serde(default = "default_true")]
    pub use_nonce: bool,

    /// PKCE policy
    #[serde(default)]
    pub pkce: PkceMode,

    /// Tolerated clock difference for `iat`, in seconds
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,

    /// Where the provider sends the browser after RP-initiated logout
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,

    /// Extra authorization request parameters (`prompt`, `acr_values`, ...)
    #[serde(default)]
    pub extra_auth_params: BTreeMap<String, String>,

    /// Token endpoint timeouts
    #[serde(default)]
    pub http: HttpClientConfig,
}

fn default_scope() -> String {
    "openid profile email".to_string()
}

fn default_response_type() -> String {
    "code".to_string()
}

fn default_true() -> bool {
    true
}

fn default_clock_skew() -> i64 {
    120
}

/// Parameters the engine sets itself and which may not be overridden.
const RESERVED_PARAMS: &[&str] = &[
    "client_id",
    "redirect_uri",
    "response_type",
    "scope",
    "state",
    "nonce",
    "code_challenge",
    "code_challenge_method",
];

impl OidcClientConfig {
    /// Create a configuration with defaults.
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: redirect_uri.into(),
            scope: default_scope(),
            response_type: default_response_type(),
            preferred_jws_algorithm: None,
            allow_unsigned_id_tokens: false,
            client_auth_method: None,
            private_key_pem: None,
            private_key_algorithm: None,
            use_state: true,
            use_nonce: true,
            pkce: PkceMode::Auto,
            clock_skew_secs: default_clock_skew(),
            post_logout_redirect_uri: None,
            extra_auth_params: BTreeMap::new(),
            http: HttpClientConfig::default(),
        }
    }

    /// Set the client secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> AuthResult<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::Configuration("client_id is required".to_string()));
        }

        url::Url::parse(&self.redirect_uri).map_err(|e| {
            AuthError::Configuration(format!("invalid redirect_uri {}: {}", self.redirect_uri, e))
        })?;

        if self.response_type != "code" {
            return Err(AuthError::Configuration(format!(
                "unsupported response_type {}",
                self.response_type
            )));
        }

        if !self.scope.split_whitespace().any(|s| s == "openid") {
            return Err(AuthError::Configuration(
                "scope must include openid".to_string(),
            ));
        }

        if self.clock_skew_secs < 0 {
            return Err(AuthError::Configuration(
                "clock skew must not be negative".to_string(),
            ));
        }

        if let Some(key) = self
            .extra_auth_params
            .keys()
            .find(|k| RESERVED_PARAMS.contains(&k.as_str()))
        {
            return Err(AuthError::Configuration(format!(
                "{} cannot be set through extra_auth_params",
                key
            )));
        }

        Ok(())
    }
}

impl fmt::Debug for OidcClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcClientConfig")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .field("preferred_jws_algorithm", &self.preferred_jws_algorithm)
            .field("allow_unsigned_id_tokens", &self.allow_unsigned_id_tokens)
            .field("client_auth_method", &self.client_auth_method)
            .field(
                "private_key_pem",
                &self.private_key_pem.as_ref().map(|_| "[REDACTED]"),
            )
            .field("use_state", &self.use_state)
            .field("use_nonce", &self.use_nonce)
            .field("pkce", &self.pkce)
            .field("clock_skew_secs", &self.clock_skew_secs)
            .finish()
    }
}
