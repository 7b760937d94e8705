//! SAML2 service provider configuration and IdP metadata.

use crate::error::{AuthError, AuthResult};
use crate::saml::binding::SamlBinding;
use crate::saml::trust::{CredentialProvider, TrustAnchor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Binding used for browser-carried requests we send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutboundBinding {
    /// HTTP-Redirect
    #[default]
    Redirect,
    /// HTTP-POST
    Post,
}

impl From<OutboundBinding> for SamlBinding {
    fn from(binding: OutboundBinding) -> Self {
        match binding {
            OutboundBinding::Redirect => SamlBinding::Redirect,
            OutboundBinding::Post => SamlBinding::Post,
        }
    }
}

/// SAML2 service provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saml2ClientConfig {
    /// Our entity ID; expected in `Audience`
    pub sp_entity_id: String,

    /// Assertion consumer service URL; expected in `Destination` / `Recipient`
    pub acs_url: String,

    /// Single logout endpoint; defaults to the ACS URL
    #[serde(default)]
    pub slo_url: Option<String>,

    /// Binding for AuthnRequest and LogoutRequest
    #[serde(default)]
    pub authn_request_binding: OutboundBinding,

    /// Accept messages with no signature at all. Testing only.
    #[serde(default)]
    pub allow_unsigned: bool,

    /// Require each assertion to carry its own signature
    #[serde(default)]
    pub want_assertions_signed: bool,

    /// Require IdP-initiated LogoutRequests to be signed
    #[serde(default = "default_true")]
    pub want_logout_requests_signed: bool,

    /// Treat Responder/PartialLogout as a successful logout
    #[serde(default)]
    pub accept_partial_logout: bool,

    /// Accept IdP-initiated responses without `InResponseTo`
    #[serde(default)]
    pub allow_unsolicited_responses: bool,

    /// Reject messages that do not name a `Destination`
    #[serde(default)]
    pub destination_mandatory: bool,

    /// Tolerated clock difference, in seconds
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,

    /// Oldest `IssueInstant` accepted, in seconds
    #[serde(default = "default_max_response_age")]
    pub max_response_age_secs: i64,

    /// Reject assertions whose `AuthnInstant` is older than this, in seconds
    #[serde(default)]
    pub max_authentication_lifetime_secs: Option<i64>,

    /// Where to send the browser after SP-initiated logout completes
    #[serde(default)]
    pub post_logout_redirect_url: Option<String>,

    /// `NameIDPolicy/@Format` in AuthnRequests
    #[serde(default)]
    pub name_id_policy_format: Option<String>,

    /// `ForceAuthn`
    #[serde(default)]
    pub force_authn: bool,

    /// `IsPassive`
    #[serde(default)]
    pub passive: bool,

    /// Requested authentication context classes
    #[serde(default)]
    pub authn_context_class_refs: Vec<String>,

    /// Sign outbound requests (needs a request signer)
    #[serde(default)]
    pub sign_requests: bool,
}

fn default_true() -> bool {
    true
}

fn default_clock_skew() -> i64 {
    120
}

fn default_max_response_age() -> i64 {
    3600
}

impl Saml2ClientConfig {
    /// Create a configuration with defaults.
    pub fn new(sp_entity_id: impl Into<String>, acs_url: impl Into<String>) -> Self {
        Self {
            sp_entity_id: sp_entity_id.into(),
            acs_url: acs_url.into(),
            slo_url: None,
            authn_request_binding: OutboundBinding::Redirect,
            allow_unsigned: false,
            want_assertions_signed: false,
            want_logout_requests_signed: true,
            accept_partial_logout: false,
            allow_unsolicited_responses: false,
            destination_mandatory: false,
            clock_skew_secs: default_clock_skew(),
            max_response_age_secs: default_max_response_age(),
            max_authentication_lifetime_secs: None,
            post_logout_redirect_url: None,
            name_id_policy_format: None,
            force_authn: false,
            passive: false,
            authn_context_class_refs: Vec::new(),
            sign_requests: false,
        }
    }

    /// Single logout endpoint.
    pub fn slo_url(&self) -> &str {
        self.slo_url.as_deref().unwrap_or(&self.acs_url)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> AuthResult<()> {
        if self.sp_entity_id.trim().is_empty() {
            return Err(AuthError::Configuration(
                "sp_entity_id is required".to_string(),
            ));
        }

        for (name, value) in [("acs_url", Some(&self.acs_url)), ("slo_url", self.slo_url.as_ref())] {
            if let Some(value) = value {
                url::Url::parse(value).map_err(|e| {
                    AuthError::Configuration(format!("invalid {} {}: {}", name, value, e))
                })?;
            }
        }

        if self.clock_skew_secs < 0 || self.max_response_age_secs <= 0 {
            return Err(AuthError::Configuration(
                "clock skew must not be negative and response age must be positive".to_string(),
            ));
        }

        if self.want_assertions_signed && self.allow_unsigned {
            return Err(AuthError::Configuration(
                "want_assertions_signed contradicts allow_unsigned".to_string(),
            ));
        }

        Ok(())
    }
}

/// Resolved IdP metadata.
#[derive(Debug, Clone, Default)]
pub struct IdpMetadata {
    /// IdP entity ID; expected as `Issuer`
    pub entity_id: String,

    /// SSO endpoint for HTTP-Redirect
    pub sso_redirect_url: Option<String>,

    /// SSO endpoint for HTTP-POST
    pub sso_post_url: Option<String>,

    /// SLO endpoint for requests
    pub slo_url: Option<String>,

    /// SLO endpoint for responses, when it differs
    pub slo_response_url: Option<String>,

    /// Verification material
    pub trust_anchor: TrustAnchor,

    /// The IdP wants signed AuthnRequests
    pub want_authn_requests_signed: bool,
}

impl IdpMetadata {
    /// Metadata with only an entity ID.
    pub fn new(entity_id: impl Into<String>) -> Self {
        let entity_id = entity_id.into();
        Self {
            trust_anchor: TrustAnchor::new(entity_id.clone()),
            entity_id,
            ..Default::default()
        }
    }

    /// SSO endpoint for a binding, falling back to the other one.
    pub fn sso_url(&self, binding: OutboundBinding) -> Option<&str> {
        match binding {
            OutboundBinding::Redirect => self.sso_redirect_url.as_deref().or(self.sso_post_url.as_deref()),
            OutboundBinding::Post => self.sso_post_url.as_deref().or(self.sso_redirect_url.as_deref()),
        }
    }

    /// Where LogoutResponses go.
    pub fn slo_response_url(&self) -> Option<&str> {
        self.slo_response_url.as_deref().or(self.slo_url.as_deref())
    }
}

impl CredentialProvider for IdpMetadata {
    fn credential(&self, entity_id: &str) -> Option<TrustAnchor> {
        (entity_id == self.entity_id).then(|| self.trust_anchor.clone())
    }
}

/// Source of IdP metadata.
#[async_trait]
pub trait IdpMetadataResolver: Send + Sync {
    /// Current snapshot.
    async fn load(&self) -> AuthResult<Arc<IdpMetadata>>;
}

/// Resolver serving configured metadata.
#[derive(Debug, Clone)]
pub struct StaticIdpMetadataResolver {
    current: Arc<RwLock<Arc<IdpMetadata>>>,
}

impl StaticIdpMetadataResolver {
    /// Serve the given metadata.
    pub fn new(metadata: IdpMetadata) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(metadata))),
        }
    }

    /// Replace the served snapshot, e.g. after a certificate rollover.
    pub async fn replace(&self, metadata: IdpMetadata) {
        *self.current.write().await = Arc::new(metadata);
    }
}

#[async_trait]
impl IdpMetadataResolver for StaticIdpMetadataResolver {
    async fn load(&self) -> AuthResult<Arc<IdpMetadata>> {
        Ok(self.current.read().await.clone())
    }
}
