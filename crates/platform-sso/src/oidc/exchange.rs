//! Token endpoint client
//!
//! Exchanges authorization codes and refresh tokens. The client
//! authentication method is negotiated once at construction; a provider
//! error response always surfaces as [`AuthError::Protocol`].

use crate::error::{AuthError, AuthResult};
use crate::jose::{JwsAlgorithm, KeyFamily};
use crate::oidc::config::OidcClientConfig;
use crate::oidc::metadata::ProviderMetadata;
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::instrument;
use uuid::Uuid;

/// JWT bearer client assertion type (RFC 7523).
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a client assertion.
const CLIENT_ASSERTION_TTL_SECS: i64 = 300;

/// Token endpoint authentication methods.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// HTTP Basic with client id and secret
    ClientSecretBasic,
    /// Client id and secret in the form body
    ClientSecretPost,
    /// HMAC signed client assertion
    ClientSecretJwt,
    /// Private key signed client assertion
    PrivateKeyJwt,
    /// Public client
    None,
}

/// Order in which methods are chosen when none is configured.
pub const CLIENT_AUTH_PRIORITY: [ClientAuthMethod; 5] = [
    ClientAuthMethod::ClientSecretBasic,
    ClientAuthMethod::ClientSecretPost,
    ClientAuthMethod::PrivateKeyJwt,
    ClientAuthMethod::ClientSecretJwt,
    ClientAuthMethod::None,
];

impl ClientAuthMethod {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMethod::ClientSecretBasic => "client_secret_basic",
            ClientAuthMethod::ClientSecretPost => "client_secret_post",
            ClientAuthMethod::ClientSecretJwt => "client_secret_jwt",
            ClientAuthMethod::PrivateKeyJwt => "private_key_jwt",
            ClientAuthMethod::None => "none",
        }
    }

    /// Parse from the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_secret_basic" => Some(ClientAuthMethod::ClientSecretBasic),
            "client_secret_post" => Some(ClientAuthMethod::ClientSecretPost),
            "client_secret_jwt" => Some(ClientAuthMethod::ClientSecretJwt),
            "private_key_jwt" => Some(ClientAuthMethod::PrivateKeyJwt),
            "none" => Some(ClientAuthMethod::None),
            _ => None,
        }
    }

    fn is_usable(&self, has_secret: bool, has_private_key: bool) -> bool {
        match self {
            ClientAuthMethod::ClientSecretBasic
            | ClientAuthMethod::ClientSecretPost
            | ClientAuthMethod::ClientSecretJwt => has_secret,
            ClientAuthMethod::PrivateKeyJwt => has_private_key,
            ClientAuthMethod::None => true,
        }
    }
}

/// Choose the token endpoint authentication method.
///
/// A configured method must be supported by the provider. Otherwise the
/// first method of [`CLIENT_AUTH_PRIORITY`] that the provider supports and
/// the client has material for wins. Providers that advertise nothing
/// support `client_secret_basic` only.
pub fn negotiate_client_auth(
    configured: Option<ClientAuthMethod>,
    provider_supported: &[String],
    has_secret: bool,
    has_private_key: bool,
) -> AuthResult<ClientAuthMethod> {
    let supported: Vec<ClientAuthMethod> = if provider_supported.is_empty() {
        vec![ClientAuthMethod::ClientSecretBasic]
    } else {
        provider_supported
            .iter()
            .filter_map(|m| ClientAuthMethod::parse(m))
            .collect()
    };

    if let Some(configured) = configured {
        if !supported.contains(&configured) {
            return Err(AuthError::Configuration(format!(
                "client authentication method {} is not supported by the provider",
                configured.as_str()
            )));
        }
        if !configured.is_usable(has_secret, has_private_key) {
            return Err(AuthError::Configuration(format!(
                "client authentication method {} needs key material that is not configured",
                configured.as_str()
            )));
        }
        return Ok(configured);
    }

    CLIENT_AUTH_PRIORITY
        .iter()
        .copied()
        .find(|m| supported.contains(m) && m.is_usable(has_secret, has_private_key))
        .ok_or_else(|| {
            AuthError::Configuration(
                "no client authentication method in common with the provider".to_string(),
            )
        })
}

/// Grant sent to the token endpoint.
pub enum TokenGrant {
    /// `authorization_code`
    AuthorizationCode {
        /// Code from the callback
        code: String,
        /// Redirect URI used in the authorization request
        redirect_uri: String,
        /// PKCE verifier, when a challenge was sent
        pkce_verifier: Option<String>,
    },
    /// `refresh_token`
    RefreshToken {
        /// Refresh token
        refresh_token: String,
    },
}

impl TokenGrant {
    /// `grant_type` value.
    pub fn grant_type(&self) -> &'static str {
        match self {
            TokenGrant::AuthorizationCode { .. } => "authorization_code",
            TokenGrant::RefreshToken { .. } => "refresh_token",
        }
    }

    fn form_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("grant_type", self.grant_type().to_string())];
        match self {
            TokenGrant::AuthorizationCode {
                code,
                redirect_uri,
                pkce_verifier,
            } => {
                params.push(("code", code.clone()));
                params.push(("redirect_uri", redirect_uri.clone()));
                if let Some(verifier) = pkce_verifier {
                    params.push(("code_verifier", verifier.clone()));
                }
            }
            TokenGrant::RefreshToken { refresh_token } => {
                params.push(("refresh_token", refresh_token.clone()));
            }
        }
        params
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("grant_type", &self.grant_type())
            .finish_non_exhaustive()
    }
}

/// Successful token endpoint response.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Expires in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,

    /// Refresh token (if provided)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// ID token
    #[serde(default)]
    pub id_token: Option<String>,

    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .finish()
    }
}

/// Token endpoint error response (RFC 6749 section 5.2).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenErrorResponse {
    /// Error code
    pub error: String,
    /// Description
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Serialize)]
struct ClientAssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    jti: String,
    iat: i64,
    exp: i64,
}

/// Calls the provider token endpoint.
pub struct AuthorizationCodeExchanger {
    http: reqwest::Client,
    client_id: String,
    client_secret: Option<String>,
    auth_method: ClientAuthMethod,
    assertion_key: Option<(EncodingKey, jsonwebtoken::Algorithm)>,
}

impl fmt::Debug for AuthorizationCodeExchanger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationCodeExchanger")
            .field("client_id", &self.client_id)
            .field("auth_method", &self.auth_method)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

impl AuthorizationCodeExchanger {
    /// Build an exchanger, negotiating client authentication against the
    /// provider.
    pub fn new(config: &OidcClientConfig, metadata: &ProviderMetadata) -> AuthResult<Self> {
        let auth_method = negotiate_client_auth(
            config.client_auth_method,
            &metadata.token_endpoint_auth_methods_supported,
            config.client_secret.is_some(),
            config.private_key_pem.is_some(),
        )?;

        let assertion_key = match auth_method {
            ClientAuthMethod::PrivateKeyJwt => Some(Self::private_key(config)?),
            ClientAuthMethod::ClientSecretJwt => {
                let secret = config.client_secret.as_ref().ok_or_else(|| {
                    AuthError::Configuration("client_secret_jwt needs a client secret".to_string())
                })?;
                Some((
                    EncodingKey::from_secret(secret.as_bytes()),
                    jsonwebtoken::Algorithm::HS256,
                ))
            }
            _ => None,
        };

        tracing::debug!(
            client_id = %config.client_id,
            method = auth_method.as_str(),
            "Client authentication negotiated"
        );

        Ok(Self {
            http: config.http.build_client()?,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_method,
            assertion_key,
        })
    }

    fn private_key(
        config: &OidcClientConfig,
    ) -> AuthResult<(EncodingKey, jsonwebtoken::Algorithm)> {
        let pem = config.private_key_pem.as_ref().ok_or_else(|| {
            AuthError::Configuration("private_key_jwt needs a private key".to_string())
        })?;
        let alg = config.private_key_algorithm.unwrap_or(JwsAlgorithm::RS256);

        let key = match alg.family() {
            KeyFamily::Rsa => EncodingKey::from_rsa_pem(pem.as_bytes()),
            KeyFamily::Ec => EncodingKey::from_ec_pem(pem.as_bytes()),
            KeyFamily::Ed => EncodingKey::from_ed_pem(pem.as_bytes()),
            KeyFamily::Hmac | KeyFamily::Unsigned => {
                return Err(AuthError::Configuration(format!(
                    "{} cannot sign a private_key_jwt assertion",
                    alg
                )))
            }
        }
        .map_err(|e| AuthError::Configuration(format!("Invalid private key: {}", e)))?;

        let jwt_alg = alg.to_jsonwebtoken().ok_or_else(|| {
            AuthError::Configuration("unsigned client assertions are not allowed".to_string())
        })?;

        Ok((key, jwt_alg))
    }

    /// Negotiated authentication method.
    pub fn auth_method(&self) -> ClientAuthMethod {
        self.auth_method
    }

    /// Send a grant to the token endpoint.
    #[instrument(skip(self, grant), fields(grant_type = grant.grant_type(), method = self.auth_method.as_str()))]
    pub async fn exchange(&self, token_endpoint: &str, grant: TokenGrant) -> AuthResult<TokenResponse> {
        let mut form = grant.form_params();
        let mut request = self.http.post(token_endpoint);

        match self.auth_method {
            ClientAuthMethod::ClientSecretBasic => {
                let secret = self.client_secret.as_deref().unwrap_or_default();
                request = request.basic_auth(form_encode(&self.client_id), Some(form_encode(secret)));
            }
            ClientAuthMethod::ClientSecretPost => {
                form.push(("client_id", self.client_id.clone()));
                form.push((
                    "client_secret",
                    self.client_secret.clone().unwrap_or_default(),
                ));
            }
            ClientAuthMethod::ClientSecretJwt | ClientAuthMethod::PrivateKeyJwt => {
                form.push(("client_id", self.client_id.clone()));
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
                form.push(("client_assertion", self.client_assertion(token_endpoint)?));
            }
            ClientAuthMethod::None => {
                form.push(("client_id", self.client_id.clone()));
            }
        }

        let response = request
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let tokens: TokenResponse = response.json().await.map_err(|e| {
                AuthError::InvalidMessage(format!("malformed token response: {}", e))
            })?;
            tracing::debug!("Token endpoint call succeeded");
            return Ok(tokens);
        }

        let body = response.text().await.map_err(|e| {
            AuthError::Communication(format!(
                "failed to read token endpoint error body (HTTP {}): {}",
                status.as_u16(),
                e
            ))
        })?;
        match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(error) => {
                tracing::warn!(
                    status = status.as_u16(),
                    error = %error.error,
                    "Token endpoint returned an error"
                );
                Err(AuthError::Protocol {
                    code: error.error,
                    description: error.error_description,
                })
            }
            Err(_) if status.is_server_error() => Err(AuthError::Communication(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            ))),
            Err(_) => Err(AuthError::Protocol {
                code: "invalid_response".to_string(),
                description: Some(format!("token endpoint returned HTTP {}", status.as_u16())),
            }),
        }
    }

    fn client_assertion(&self, token_endpoint: &str) -> AuthResult<String> {
        let (key, alg) = self.assertion_key.as_ref().ok_or_else(|| {
            AuthError::Internal("client assertion key missing".to_string())
        })?;

        let now = Utc::now().timestamp();
        let claims = ClientAssertionClaims {
            iss: &self.client_id,
            sub: &self.client_id,
            aud: token_endpoint,
            jti: Uuid::now_v7().to_string(),
            iat: now,
            exp: now + CLIENT_ASSERTION_TTL_SECS,
        };

        jsonwebtoken::encode(&Header::new(*alg), &claims, key)
            .map_err(|e| AuthError::Internal(format!("Failed to sign client assertion: {}", e)))
    }
}

/// `application/x-www-form-urlencoded` encoding of a Basic credential part.
fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn methods(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_negotiation_prefers_configured_method() {
        let supported = methods(&["client_secret_post", "client_secret_basic"]);
        assert_eq!(
            negotiate_client_auth(
                Some(ClientAuthMethod::ClientSecretPost),
                &supported,
                true,
                false
            )
            .unwrap(),
            ClientAuthMethod::ClientSecretPost
        );
    }

    #[test]
    fn test_negotiation_priority_order() {
        let supported = methods(&["private_key_jwt", "client_secret_post", "client_secret_basic"]);
        assert_eq!(
            negotiate_client_auth(None, &supported, true, true).unwrap(),
            ClientAuthMethod::ClientSecretBasic
        );

        let no_secret = negotiate_client_auth(None, &supported, false, true).unwrap();
        assert_eq!(no_secret, ClientAuthMethod::PrivateKeyJwt);
    }

    #[test]
    fn test_negotiation_fails_closed() {
        let supported = methods(&["tls_client_auth"]);
        assert!(matches!(
            negotiate_client_auth(None, &supported, true, false),
            Err(AuthError::Configuration(_))
        ));

        assert!(negotiate_client_auth(
            Some(ClientAuthMethod::PrivateKeyJwt),
            &methods(&["client_secret_basic"]),
            true,
            true
        )
        .is_err());
    }

    #[test]
    fn test_negotiation_default_provider_methods() {
        assert_eq!(
            negotiate_client_auth(None, &[], true, false).unwrap(),
            ClientAuthMethod::ClientSecretBasic
        );
        assert!(negotiate_client_auth(None, &[], false, false).is_err());
    }

    fn exchanger(server: &MockServer, method: ClientAuthMethod) -> (AuthorizationCodeExchanger, String) {
        exchanger_at(&server.uri(), method)
    }

    fn exchanger_at(base: &str, method: ClientAuthMethod) -> (AuthorizationCodeExchanger, String) {
        let mut config = OidcClientConfig::new("app", "https://app.example.com/callback")
            .with_secret("s3cret");
        config.client_auth_method = Some(method);

        let mut metadata = ProviderMetadata::new(base, format!("{}/authorize", base));
        metadata.token_endpoint_auth_methods_supported =
            methods(&["client_secret_basic", "client_secret_post", "client_secret_jwt"]);

        (
            AuthorizationCodeExchanger::new(&config, &metadata).unwrap(),
            format!("{}/token", base),
        )
    }

    fn code_grant() -> TokenGrant {
        TokenGrant::AuthorizationCode {
            code: "code-1".to_string(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            pkce_verifier: Some("verifier-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_basic_auth_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("authorization", "Basic YXBwOnMzY3JldA=="))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier=verifier-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "token_type": "Bearer",
                "expires_in": 3600,
                "id_token": "id.token.sig"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (exchanger, endpoint) = exchanger(&server, ClientAuthMethod::ClientSecretBasic);
        let tokens = exchanger.exchange(&endpoint, code_grant()).await.unwrap();

        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.expires_in, Some(3600));
        assert_eq!(tokens.id_token.as_deref(), Some("id.token.sig"));
    }

    #[tokio::test]
    async fn test_post_and_jwt_auth_send_client_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("client_secret=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "post"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("client_assertion_type="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "jwt"
            })))
            .mount(&server)
            .await;

        let (post, endpoint) = exchanger(&server, ClientAuthMethod::ClientSecretPost);
        assert_eq!(
            post.exchange(&endpoint, code_grant()).await.unwrap().access_token,
            "post"
        );

        let (jwt, endpoint) = exchanger(&server, ClientAuthMethod::ClientSecretJwt);
        assert_eq!(
            jwt.exchange(&endpoint, code_grant()).await.unwrap().access_token,
            "jwt"
        );
    }

    #[tokio::test]
    async fn test_error_response_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "code already used"
            })))
            .mount(&server)
            .await;

        let (exchanger, endpoint) = exchanger(&server, ClientAuthMethod::ClientSecretBasic);
        let err = exchanger.exchange(&endpoint, code_grant()).await.unwrap_err();

        match err {
            AuthError::Protocol { code, description } => {
                assert_eq!(code, "invalid_grant");
                assert_eq!(description.as_deref(), Some("code already used"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_failure_is_communication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let (exchanger, endpoint) = exchanger(&server, ClientAuthMethod::ClientSecretBasic);
        assert!(matches!(
            exchanger.exchange(&endpoint, code_grant()).await,
            Err(AuthError::Communication(_))
        ));
    }

    /// Whether `raw` holds the full headers and the announced body.
    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then_some(value)?
                    .trim()
                    .parse::<usize>()
                    .ok()
            })
            .unwrap_or(0);
        raw.len() >= header_end + 4 + length
    }

    #[tokio::test]
    async fn test_truncated_error_body_is_communication_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Announces a 64 byte error body, sends one byte, then hangs up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !request_complete(&request) {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&chunk[..n]),
                }
            }
            let _ = socket
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Type: application/json\r\nContent-Length: 64\r\n\r\n{")
                .await;
        });

        let (exchanger, endpoint) =
            exchanger_at(&format!("http://{}", addr), ClientAuthMethod::ClientSecretBasic);
        assert!(matches!(
            exchanger.exchange(&endpoint, code_grant()).await,
            Err(AuthError::Communication(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "refresh_token": "rt-2"
            })))
            .mount(&server)
            .await;

        let (exchanger, endpoint) = exchanger(&server, ClientAuthMethod::ClientSecretBasic);
        let tokens = exchanger
            .exchange(
                &endpoint,
                TokenGrant::RefreshToken {
                    refresh_token: "rt-1".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at-2");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-2"));
    }
}
