//! Authentication pipeline
//!
//! One pipeline drives one configured client through the login and logout
//! exchanges:
//!
//! ```text
//! build_redirect ──> (provider) ──> handle_callback ──> UserProfile
//!                                         │
//!                                 extract ─ validate ─ renew session ─ track
//!
//! handle_logout ──> extract ─ validate notification ─ destroy session ──> LogoutOutcome
//! ```
//!
//! Nothing is written to the session or the replay cache before the inbound
//! message has been verified.

use crate::cas::CasClient;
use crate::config::PipelineConfig;
use crate::context::{RedirectInstruction, RequestContext};
use crate::credentials::{Credentials, LogoutCredentials, LogoutType, SessionKeyCredentials};
use crate::error::{AuthError, AuthResult};
use crate::generator::{SecureValueGenerator, ValueGenerator};
use crate::logout::{DefaultLogoutHandler, LogoutHandler, LogoutOutcome};
use crate::oidc::OidcClient;
use crate::profile::UserProfile;
use crate::saml::model::SamlMessage;
use crate::saml::Saml2Client;
use crate::session::{SessionKeys, SessionStore};
use platform_replay::{MemoryReplayCache, ReplayCache};
use std::sync::Arc;

/// Stage of an authentication exchange, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    /// Sending the browser to the provider
    Redirecting,
    /// Callback received, credentials extracted
    AwaitingCallback,
    /// Credentials under validation
    Validating,
    /// Login complete
    ProfileReady,
    /// Logout notification received
    LogoutReceived,
    /// Logout processed
    LogoutHandled,
}

/// Collaborators a protocol client needs for one exchange.
#[derive(Clone, Copy)]
pub struct FlowServices<'a> {
    /// Client name recorded on profiles
    pub client_name: &'a str,
    /// Session key names for this client
    pub keys: &'a SessionKeys,
    /// Browser session storage
    pub sessions: &'a dyn SessionStore,
    /// Replay protection
    pub replay: &'a dyn ReplayCache,
    /// Correlation value source
    pub generator: &'a dyn ValueGenerator,
}

/// Protocol client driven by a pipeline.
#[derive(Debug)]
pub enum ProtocolClient {
    /// OpenID Connect relying party
    Oidc(OidcClient),
    /// SAML2 service provider
    Saml2(Saml2Client),
    /// CAS service
    Cas(CasClient),
}

impl ProtocolClient {
    /// Short name for logs.
    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolClient::Oidc(_) => "oidc",
            ProtocolClient::Saml2(_) => "saml2",
            ProtocolClient::Cas(_) => "cas",
        }
    }
}

impl From<OidcClient> for ProtocolClient {
    fn from(client: OidcClient) -> Self {
        ProtocolClient::Oidc(client)
    }
}

impl From<Saml2Client> for ProtocolClient {
    fn from(client: Saml2Client) -> Self {
        ProtocolClient::Saml2(client)
    }
}

impl From<CasClient> for ProtocolClient {
    fn from(client: CasClient) -> Self {
        ProtocolClient::Cas(client)
    }
}

/// Login and logout orchestration for one client.
pub struct AuthenticationPipeline {
    config: PipelineConfig,
    client: ProtocolClient,
    keys: SessionKeys,
    sessions: Arc<dyn SessionStore>,
    replay: Arc<dyn ReplayCache>,
    generator: Arc<dyn ValueGenerator>,
    logout_handler: Arc<dyn LogoutHandler>,
}

impl std::fmt::Debug for AuthenticationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationPipeline")
            .field("config", &self.config)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl AuthenticationPipeline {
    /// Create a pipeline with an in-memory replay cache, the secure value
    /// generator and the in-memory logout handler.
    pub fn new(
        config: PipelineConfig,
        client: impl Into<ProtocolClient>,
        sessions: Arc<dyn SessionStore>,
    ) -> AuthResult<Self> {
        config.validate()?;
        let client = client.into();

        tracing::info!(
            client = %config.client_name,
            protocol = client.protocol(),
            "Authentication pipeline created"
        );

        Ok(Self {
            keys: SessionKeys::new(config.client_name.clone()),
            config,
            client,
            sessions,
            replay: Arc::new(MemoryReplayCache::new()),
            generator: Arc::new(SecureValueGenerator::new()),
            logout_handler: Arc::new(DefaultLogoutHandler::new()),
        })
    }

    /// Use a shared replay cache (required when running several nodes).
    pub fn with_replay_cache(mut self, replay: Arc<dyn ReplayCache>) -> Self {
        self.replay = replay;
        self
    }

    /// Replace the correlation value generator.
    pub fn with_generator(mut self, generator: Arc<dyn ValueGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Replace the logout handler.
    pub fn with_logout_handler(mut self, handler: Arc<dyn LogoutHandler>) -> Self {
        self.logout_handler = handler;
        self
    }

    /// Pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Protocol client.
    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    fn flow(&self) -> FlowServices<'_> {
        FlowServices {
            client_name: &self.config.client_name,
            keys: &self.keys,
            sessions: self.sessions.as_ref(),
            replay: self.replay.as_ref(),
            generator: self.generator.as_ref(),
        }
    }

    fn stage(&self, stage: FlowStage) {
        tracing::debug!(client = %self.config.client_name, stage = ?stage, "Flow stage");
    }

    /// Build the redirect to the provider, storing correlation state in the
    /// session.
    pub async fn build_redirect(&self, ctx: &RequestContext) -> AuthResult<RedirectInstruction> {
        self.stage(FlowStage::Redirecting);
        let flow = self.flow();
        match &self.client {
            ProtocolClient::Oidc(client) => client.build_redirect(ctx, &flow).await,
            ProtocolClient::Saml2(client) => client.build_redirect(ctx, &flow).await,
            ProtocolClient::Cas(client) => Ok(client.build_redirect()),
        }
    }

    /// Classify the request and extract its credentials.
    ///
    /// `Ok(None)` means the request carries nothing this client understands,
    /// including provider error responses.
    pub async fn extract_credentials(&self, ctx: &RequestContext) -> AuthResult<Option<Credentials>> {
        let credentials = match &self.client {
            ProtocolClient::Oidc(client) => client.extract(ctx).await?,
            ProtocolClient::Saml2(client) => client.extract(ctx)?,
            ProtocolClient::Cas(client) => client.extract(ctx)?,
        };

        if let Some(credentials) = &credentials {
            let stage = if credentials.is_logout() {
                FlowStage::LogoutReceived
            } else {
                FlowStage::AwaitingCallback
            };
            tracing::debug!(
                client = %self.config.client_name,
                stage = ?stage,
                kind = credentials.kind(),
                "Credentials extracted"
            );
        }
        Ok(credentials)
    }

    /// Validate login credentials against the configured client.
    pub async fn validate(
        &self,
        ctx: &RequestContext,
        credentials: Credentials,
    ) -> AuthResult<UserProfile> {
        self.stage(FlowStage::Validating);
        let flow = self.flow();
        match (&self.client, credentials) {
            (ProtocolClient::Oidc(client), Credentials::Oidc(creds)) => {
                client.validate(ctx, creds, &flow).await
            }
            (ProtocolClient::Saml2(client), Credentials::Saml2(inbound)) => {
                client.validate(ctx, &inbound, &flow).await
            }
            (ProtocolClient::Cas(client), Credentials::Cas(creds)) => {
                client.validate(creds, &flow).await
            }
            (_, Credentials::Logout(_)) => Err(AuthError::InvalidMessage(
                "logout notification received on the login path".to_string(),
            )),
            (client, credentials) => Err(AuthError::InvalidMessage(format!(
                "{} credentials presented to a {} client",
                credentials.kind(),
                client.protocol()
            ))),
        }
    }

    /// Process a provider callback end to end.
    ///
    /// On success the session is renewed (when configured) and the provider
    /// session keys are recorded for later logout notifications. The renewed
    /// session identifier is written back into `ctx`.
    pub async fn handle_callback(&self, ctx: &mut RequestContext) -> AuthResult<UserProfile> {
        let Some(credentials) = self.extract_credentials(ctx).await? else {
            return Err(match ctx.parameter("error") {
                Some(error) => AuthError::protocol(
                    error,
                    ctx.parameter("error_description").map(String::from),
                ),
                None => AuthError::MissingCredentials,
            });
        };

        let profile = match self.validate(ctx, credentials).await {
            Ok(profile) => profile,
            Err(e) => {
                if e.is_security_rejection() {
                    tracing::warn!(
                        client = %self.config.client_name,
                        error_code = e.error_code(),
                        error = %e,
                        "Login rejected"
                    );
                } else {
                    tracing::debug!(client = %self.config.client_name, error = %e, "Login failed");
                }
                return Err(e);
            }
        };

        if self.config.renew_session_on_login {
            self.sessions.renew(ctx).await?;
        }

        if self.config.track_sessions {
            for key in profile.logout_keys() {
                self.logout_handler.record_session(ctx, key).await?;
            }
        }

        self.stage(FlowStage::ProfileReady);
        tracing::info!(
            client = %self.config.client_name,
            subject = %profile.id,
            method = profile.auth_method.as_str(),
            "Login succeeded"
        );
        Ok(profile)
    }

    /// Process a logout notification from the provider.
    pub async fn handle_logout(&self, ctx: &RequestContext) -> AuthResult<LogoutOutcome> {
        let credentials = match self.extract_credentials(ctx).await? {
            Some(Credentials::Logout(credentials)) => credentials,
            _ => return Err(AuthError::MissingCredentials),
        };

        let flow = self.flow();
        let outcome = match (&self.client, credentials) {
            (_, LogoutCredentials::SessionKey(creds)) => {
                self.destroy(ctx, &creds).await?;
                LogoutOutcome::Acknowledged
            }
            (ProtocolClient::Oidc(client), LogoutCredentials::OidcLogoutToken(token)) => {
                let creds = client.validate_logout_token(&token, &flow).await?;
                self.destroy(ctx, &creds).await?;
                LogoutOutcome::Acknowledged
            }
            (ProtocolClient::Saml2(client), LogoutCredentials::Saml(inbound)) => {
                match &inbound.message {
                    SamlMessage::LogoutRequest(_) => {
                        let request = client.validate_logout_request(&inbound, &flow).await?;
                        self.destroy(ctx, &request.session).await?;
                        client.logout_response_outcome(&request, &flow).await?
                    }
                    SamlMessage::LogoutResponse(_) => {
                        let outcome = client.validate_logout_response(ctx, &inbound, &flow).await?;
                        self.sessions.destroy(ctx).await?;
                        outcome
                    }
                    SamlMessage::Response(_) => {
                        return Err(AuthError::InvalidMessage(
                            "authentication response received on the logout path".to_string(),
                        ))
                    }
                }
            }
            (client, _) => {
                return Err(AuthError::InvalidMessage(format!(
                    "logout notification not understood by a {} client",
                    client.protocol()
                )))
            }
        };

        self.stage(FlowStage::LogoutHandled);
        Ok(outcome)
    }

    async fn destroy(&self, ctx: &RequestContext, creds: &SessionKeyCredentials) -> AuthResult<bool> {
        let destroyed = match creds.logout_type {
            LogoutType::FrontChannel => {
                self.logout_handler
                    .destroy_session_front(ctx, self.sessions.as_ref(), &creds.session_key)
                    .await?
            }
            LogoutType::BackChannel => {
                self.logout_handler
                    .destroy_session_back(self.sessions.as_ref(), &creds.session_key)
                    .await?
            }
        };

        tracing::info!(
            client = %self.config.client_name,
            logout_type = ?creds.logout_type,
            destroyed,
            "Logout notification processed"
        );
        Ok(destroyed)
    }

    /// Application-initiated logout: redirect to the provider's logout
    /// endpoint.
    ///
    /// OIDC and CAS end the local session right away. SAML keeps it until
    /// the IdP's LogoutResponse comes back through [`Self::handle_logout`].
    pub async fn build_logout_redirect(
        &self,
        ctx: &RequestContext,
        profile: Option<&UserProfile>,
    ) -> AuthResult<RedirectInstruction> {
        let flow = self.flow();
        let redirect = match &self.client {
            ProtocolClient::Oidc(client) => {
                let redirect = client.build_logout_redirect(profile, &flow).await?;
                self.sessions.destroy(ctx).await?;
                redirect
            }
            ProtocolClient::Saml2(client) => {
                client.build_logout_redirect(ctx, profile, &flow).await?
            }
            ProtocolClient::Cas(client) => {
                let redirect = client.build_logout_redirect();
                self.sessions.destroy(ctx).await?;
                redirect
            }
        };

        tracing::info!(client = %self.config.client_name, "Logout redirect built");
        Ok(redirect)
    }

    /// Renew the profile's tokens. OIDC only.
    pub async fn refresh(&self, profile: &UserProfile) -> AuthResult<UserProfile> {
        match &self.client {
            ProtocolClient::Oidc(client) => client.refresh(profile).await,
            other => Err(AuthError::Unsupported(format!(
                "{} profiles cannot be refreshed",
                other.protocol()
            ))),
        }
    }
}
