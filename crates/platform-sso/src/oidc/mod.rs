//! OpenID Connect
//!
//! Authorization code flow with PKCE, ID token validation, token refresh,
//! RP-initiated logout and front/back-channel logout notifications.

pub mod client;
pub mod config;
pub mod exchange;
pub mod logout;
pub mod metadata;
pub mod token_validator;

pub use client::{select_pkce_method, OidcClient};
pub use config::{OidcClientConfig, PkceMode};
pub use exchange::{
    negotiate_client_auth, AuthorizationCodeExchanger, ClientAuthMethod, TokenGrant,
    TokenResponse,
};
pub use logout::{validate_logout_token, BACKCHANNEL_LOGOUT_EVENT};
pub use metadata::{ProviderMetadata, ProviderMetadataResolver, StaticMetadataResolver};
pub use token_validator::{negotiate_algorithms, Audience, IdTokenClaims, TokenValidator};
