//! # Platform SSO
//!
//! This crate provides the single sign-on engine for the Relay platform:
//! one pipeline that drives a client through an external identity
//! provider's handshake and hands back a verified [`UserProfile`].
//!
//! ## Overview
//!
//! The platform-sso crate handles:
//! - **OIDC**: Authorization code flow with state, nonce and PKCE, ID token
//!   validation, refresh, RP-initiated and front/back-channel logout
//! - **SAML2**: AuthnRequest, Response validation and single logout over the
//!   HTTP-Redirect, HTTP-POST and SOAP bindings
//! - **CAS**: Service ticket validation and CAS single logout
//! - **Correlation**: CSRF state, nonce and PKCE verifier kept in the browser
//!   session and consumed once on callback
//! - **Replay protection**: Assertion IDs, logout token `jti` values and CAS
//!   tickets recorded through `platform-replay`
//!
//! ## Features
//!
//! - `redis`: Redis-backed replay cache for multi-node deployments
//!
//! ## Usage
//!
//! ```rust,no_run
//! use platform_sso::{
//!     AuthenticationPipeline, InMemorySessionStore, OidcClient, OidcClientConfig,
//!     PipelineConfig, ProviderMetadata, RequestContext, StaticMetadataResolver,
//! };
//! use std::sync::Arc;
//!
//! async fn example(metadata: ProviderMetadata) -> platform_sso::AuthResult<()> {
//!     let config = OidcClientConfig::new(
//!         "client-id",
//!         "https://app.example.com/callback",
//!     ).with_secret("secret");
//!     let client = OidcClient::new(config, Arc::new(StaticMetadataResolver::new(metadata))).await?;
//!
//!     let pipeline = AuthenticationPipeline::new(
//!         PipelineConfig::new("oidc"),
//!         client,
//!         Arc::new(InMemorySessionStore::new()),
//!     )?;
//!
//!     // Login: send the browser to the provider
//!     let ctx = RequestContext::get("https://app.example.com/login", "session-1");
//!     let redirect = pipeline.build_redirect(&ctx).await?;
//!     println!("{:?}", redirect.location());
//!
//!     // Callback: validate and get the profile
//!     let mut ctx = RequestContext::get(
//!         "https://app.example.com/callback?code=abc&state=xyz",
//!         "session-1",
//!     );
//!     let profile = pipeline.handle_callback(&mut ctx).await?;
//!     println!("{} logged in", profile.id);
//!     Ok(())
//! }
//! ```
//!
//! ## Collaborators
//!
//! The hosting application supplies:
//! - a [`SessionStore`] bound to the browser session
//! - provider metadata ([`ProviderMetadataResolver`], [`IdpMetadataResolver`])
//! - for SAML, a [`TrustEngine`] and optionally a [`Decrypter`] and
//!   [`RequestSigner`]

pub mod cas;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod generator;
pub mod jose;
pub mod logout;
pub mod oidc;
pub mod pipeline;
pub mod profile;
pub mod saml;
pub mod session;

// Re-export main types
pub use cas::{CasClient, CasClientConfig, CasProtocol};
pub use config::{HttpClientConfig, PipelineConfig};
pub use context::{HttpMethod, RedirectInstruction, RequestContext};
pub use credentials::{
    CasCredentials, Credentials, LogoutCredentials, LogoutType, OidcCredentials,
    Saml2Credentials, SessionKeyCredentials,
};
pub use error::{AuthError, AuthResult, ErrorKind};
pub use generator::{PkceMethod, SecureValueGenerator, ValueGenerator, ValuePurpose};
pub use logout::{DefaultLogoutHandler, LogoutHandler, LogoutOutcome};
pub use oidc::{
    OidcClient, OidcClientConfig, PkceMode, ProviderMetadata, ProviderMetadataResolver,
    StaticMetadataResolver,
};
pub use pipeline::{AuthenticationPipeline, FlowServices, FlowStage, ProtocolClient};
pub use profile::{AuthMethod, CasMaterial, OidcMaterial, ProtocolMaterial, Saml2Material, UserProfile};
pub use saml::{
    CredentialProvider, Decrypter, IdpMetadata, IdpMetadataResolver, RequestSigner, Saml2Client,
    Saml2ClientConfig, StaticIdpMetadataResolver, TrustAnchor, TrustEngine,
};
pub use session::{CorrelationState, InMemorySessionStore, SessionKeys, SessionStore};

pub use platform_replay::{MemoryReplayCache, ReplayCache};
