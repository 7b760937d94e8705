//! Provider metadata contract.
//!
//! Discovery and key-set retrieval belong to the hosting application. The
//! engine only consumes an already resolved snapshot through
//! [`ProviderMetadataResolver::load`], called on every validation.

use crate::error::AuthResult;
use crate::jose::{JwsAlgorithm, ProviderKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolved OpenID provider metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier, compared exactly against `iss`
    pub issuer: String,

    /// Authorization endpoint
    pub authorization_endpoint: String,

    /// Token endpoint
    #[serde(default)]
    pub token_endpoint: Option<String>,

    /// RP-initiated logout endpoint
    #[serde(default)]
    pub end_session_endpoint: Option<String>,

    /// Signing keys
    #[serde(default)]
    pub keys: Vec<ProviderKey>,

    /// Advertised ID token signing algorithms
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// Advertised token endpoint authentication methods
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Advertised PKCE methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,

    /// Back-channel logout support
    #[serde(default)]
    pub backchannel_logout_supported: bool,

    /// Front-channel logout support
    #[serde(default)]
    pub frontchannel_logout_supported: bool,
}

impl ProviderMetadata {
    /// Create metadata with the two mandatory endpoints.
    pub fn new(issuer: impl Into<String>, authorization_endpoint: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            authorization_endpoint: authorization_endpoint.into(),
            token_endpoint: None,
            end_session_endpoint: None,
            keys: Vec::new(),
            id_token_signing_alg_values_supported: Vec::new(),
            token_endpoint_auth_methods_supported: Vec::new(),
            code_challenge_methods_supported: Vec::new(),
            backchannel_logout_supported: false,
            frontchannel_logout_supported: false,
        }
    }

    /// Advertised ID token algorithms the engine knows, in provider order.
    ///
    /// Providers that advertise nothing get the OIDC default, RS256.
    pub fn id_token_algorithms(&self) -> Vec<JwsAlgorithm> {
        if self.id_token_signing_alg_values_supported.is_empty() {
            return vec![JwsAlgorithm::RS256];
        }

        self.id_token_signing_alg_values_supported
            .iter()
            .filter_map(|name| {
                let alg = JwsAlgorithm::parse(name);
                if alg.is_none() {
                    tracing::debug!(alg = %name, "Ignoring unknown signing algorithm");
                }
                alg
            })
            .collect()
    }
}

/// Source of provider metadata snapshots.
#[async_trait]
pub trait ProviderMetadataResolver: Send + Sync {
    /// Current snapshot; may be cached and refreshed by the implementation.
    async fn load(&self) -> AuthResult<Arc<ProviderMetadata>>;
}

/// Resolver serving configured metadata.
///
/// [`StaticMetadataResolver::replace`] swaps the snapshot, which is how a
/// hosting application feeds in refreshed key sets.
#[derive(Debug, Clone)]
pub struct StaticMetadataResolver {
    current: Arc<RwLock<Arc<ProviderMetadata>>>,
}

impl StaticMetadataResolver {
    /// Serve the given metadata.
    pub fn new(metadata: ProviderMetadata) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(metadata))),
        }
    }

    /// Replace the served snapshot.
    pub async fn replace(&self, metadata: ProviderMetadata) {
        *self.current.write().await = Arc::new(metadata);
    }
}

#[async_trait]
impl ProviderMetadataResolver for StaticMetadataResolver {
    async fn load(&self) -> AuthResult<Arc<ProviderMetadata>> {
        Ok(self.current.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parsing() {
        let mut metadata = ProviderMetadata::new("https://op", "https://op/authorize");
        assert_eq!(metadata.id_token_algorithms(), vec![JwsAlgorithm::RS256]);

        metadata.id_token_signing_alg_values_supported =
            vec!["ES256".to_string(), "XX999".to_string(), "RS256".to_string()];
        assert_eq!(
            metadata.id_token_algorithms(),
            vec![JwsAlgorithm::ES256, JwsAlgorithm::RS256]
        );
    }

    #[test]
    fn test_discovery_document_shape() {
        let metadata: ProviderMetadata = serde_json::from_str(
            r#"{
                "issuer": "https://op.example.com",
                "authorization_endpoint": "https://op.example.com/authorize",
                "token_endpoint": "https://op.example.com/token",
                "jwks_uri": "https://op.example.com/jwks",
                "id_token_signing_alg_values_supported": ["RS256"]
            }"#,
        )
        .unwrap();

        assert_eq!(
            metadata.token_endpoint.as_deref(),
            Some("https://op.example.com/token")
        );
        assert!(metadata.keys.is_empty());
    }

    #[tokio::test]
    async fn test_replace_snapshot() {
        let resolver =
            StaticMetadataResolver::new(ProviderMetadata::new("https://op/1", "https://op/a"));
        assert_eq!(resolver.load().await.unwrap().issuer, "https://op/1");

        resolver
            .replace(ProviderMetadata::new("https://op/2", "https://op/a"))
            .await;
        assert_eq!(resolver.load().await.unwrap().issuer, "https://op/2");
    }
}
