//! OpenID Connect relying party.

use crate::context::{append_query, HttpMethod, RedirectInstruction, RequestContext};
use crate::credentials::{
    Credentials, LogoutCredentials, LogoutType, OidcCredentials, SessionKeyCredentials,
};
use crate::error::{AuthError, AuthResult};
use crate::generator::{PkceMethod, ValuePurpose};
use crate::oidc::config::{OidcClientConfig, PkceMode};
use crate::oidc::exchange::{AuthorizationCodeExchanger, TokenGrant, TokenResponse};
use crate::oidc::logout::validate_logout_token;
use crate::oidc::metadata::{ProviderMetadata, ProviderMetadataResolver};
use crate::oidc::token_validator::{IdTokenClaims, TokenValidator};
use crate::pipeline::FlowServices;
use crate::profile::{OidcMaterial, ProtocolMaterial, UserProfile};
use crate::session::{verify_correlation_value, CorrelationState};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Pick the PKCE method for the authorization request.
///
/// `S256` whenever the provider advertises it; `plain` only when it is the
/// provider's sole method.
pub fn select_pkce_method(mode: PkceMode, advertised: &[String]) -> AuthResult<Option<PkceMethod>> {
    let has_s256 = advertised.iter().any(|m| m == "S256");
    let plain_only = !advertised.is_empty() && advertised.iter().all(|m| m == "plain");

    match mode {
        PkceMode::Disabled => Ok(None),
        PkceMode::Auto if has_s256 => Ok(Some(PkceMethod::S256)),
        PkceMode::Auto if plain_only => Ok(Some(PkceMethod::Plain)),
        PkceMode::Auto => Ok(None),
        PkceMode::Required if plain_only => Ok(Some(PkceMethod::Plain)),
        PkceMode::Required if has_s256 || advertised.is_empty() => Ok(Some(PkceMethod::S256)),
        PkceMode::Required => Err(AuthError::Configuration(
            "PKCE is required but the provider supports no known challenge method".to_string(),
        )),
    }
}

/// OIDC authorization code flow client.
///
/// Built in two phases: [`OidcClient::new`] loads the provider metadata
/// once, negotiates signing algorithms, client authentication and PKCE, and
/// fails with a configuration error if any of them has no answer. The
/// resulting client is immutable.
pub struct OidcClient {
    config: OidcClientConfig,
    resolver: Arc<dyn ProviderMetadataResolver>,
    validator: TokenValidator,
    exchanger: AuthorizationCodeExchanger,
    pkce_method: Option<PkceMethod>,
}

impl std::fmt::Debug for OidcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcClient")
            .field("config", &self.config)
            .field("validator", &self.validator)
            .field("exchanger", &self.exchanger)
            .field("pkce_method", &self.pkce_method)
            .finish()
    }
}

impl OidcClient {
    /// Build a client.
    pub async fn new(
        config: OidcClientConfig,
        resolver: Arc<dyn ProviderMetadataResolver>,
    ) -> AuthResult<Self> {
        config.validate()?;
        let metadata = resolver.load().await?;

        if metadata.token_endpoint.is_none() {
            return Err(AuthError::Configuration(
                "provider metadata has no token_endpoint".to_string(),
            ));
        }

        let validator = TokenValidator::new(&config, &metadata)?;
        let exchanger = AuthorizationCodeExchanger::new(&config, &metadata)?;
        let pkce_method =
            select_pkce_method(config.pkce, &metadata.code_challenge_methods_supported)?;

        tracing::info!(
            client_id = %config.client_id,
            issuer = %metadata.issuer,
            pkce = ?pkce_method,
            "OIDC client initialized"
        );

        Ok(Self {
            config,
            resolver,
            validator,
            exchanger,
            pkce_method,
        })
    }

    /// Client configuration.
    pub fn config(&self) -> &OidcClientConfig {
        &self.config
    }

    /// Negotiated ID token validator.
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Negotiated PKCE method.
    pub fn pkce_method(&self) -> Option<PkceMethod> {
        self.pkce_method
    }

    async fn metadata(&self) -> AuthResult<Arc<ProviderMetadata>> {
        self.resolver.load().await
    }

    /// Build the authorization request and store its correlation.
    pub async fn build_redirect(
        &self,
        ctx: &RequestContext,
        flow: &FlowServices<'_>,
    ) -> AuthResult<RedirectInstruction> {
        let metadata = self.metadata().await?;
        let mut correlation = CorrelationState::new();

        let mut params: Vec<(&str, String)> = vec![
            ("response_type", self.config.response_type.clone()),
            ("client_id", self.config.client_id.clone()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("scope", self.config.scope.clone()),
        ];

        if self.config.use_state {
            let state = flow.generator.generate(ValuePurpose::State);
            params.push(("state", state.clone()));
            correlation.state = Some(state);
        }

        if self.config.use_nonce {
            let nonce = flow.generator.generate(ValuePurpose::Nonce);
            params.push(("nonce", nonce.clone()));
            correlation.nonce = Some(nonce);
        }

        if let Some(method) = self.pkce_method {
            let verifier = flow.generator.generate(ValuePurpose::PkceVerifier);
            params.push(("code_challenge", method.challenge(&verifier)));
            params.push(("code_challenge_method", method.as_str().to_string()));
            correlation.pkce_verifier = Some(verifier);
        }

        for (name, value) in &self.config.extra_auth_params {
            params.push((name.as_str(), value.clone()));
        }

        correlation.save(flow.sessions, ctx, flow.keys).await?;

        Ok(RedirectInstruction::Location(append_query(
            &metadata.authorization_endpoint,
            &params,
        )))
    }

    /// Classify the request and pull out its credentials.
    ///
    /// Provider error responses yield `Ok(None)` after being logged.
    pub async fn extract(&self, ctx: &RequestContext) -> AuthResult<Option<Credentials>> {
        if ctx.method == HttpMethod::Post {
            if let Some(token) = ctx.form_param("logout_token") {
                return Ok(Some(Credentials::Logout(LogoutCredentials::OidcLogoutToken(
                    token.to_string(),
                ))));
            }
        }

        if let Some(sid) = ctx.query_param("sid").filter(|_| !ctx.has_parameter("code")) {
            let mut creds = SessionKeyCredentials::new(sid, LogoutType::FrontChannel);
            if let Some(iss) = ctx.query_param("iss") {
                let metadata = self.metadata().await?;
                if iss != metadata.issuer {
                    tracing::warn!(iss = %iss, "Front-channel logout from unexpected issuer");
                    return Err(AuthError::InvalidClaim(format!(
                        "logout issuer {} does not match {}",
                        iss, metadata.issuer
                    )));
                }
                creds = creds.with_issuer(iss);
            }
            return Ok(Some(Credentials::Logout(LogoutCredentials::SessionKey(creds))));
        }

        if let Some(error) = ctx.parameter("error") {
            tracing::warn!(
                error = %error,
                description = ctx.parameter("error_description").unwrap_or(""),
                "Provider returned an error response"
            );
            return Ok(None);
        }

        let credentials = OidcCredentials {
            code: ctx.parameter("code").map(String::from),
            state: ctx.parameter("state").map(String::from),
            id_token: ctx.parameter("id_token").map(String::from),
            access_token: ctx.parameter("access_token").map(String::from),
            refresh_token: None,
        };

        // Only the code flow is supported; a bare id_token is not a callback
        if credentials.code.is_none() {
            if credentials.id_token.is_some() {
                tracing::debug!("Ignoring callback that carries an id_token but no code");
            }
            return Ok(None);
        }

        Ok(Some(Credentials::Oidc(credentials)))
    }

    /// Validate a callback: correlation, code exchange and ID token.
    pub async fn validate(
        &self,
        ctx: &RequestContext,
        credentials: OidcCredentials,
        flow: &FlowServices<'_>,
    ) -> AuthResult<UserProfile> {
        let correlation = CorrelationState::take(flow.sessions, ctx, flow.keys).await?;

        if self.config.use_state {
            verify_correlation_value(
                "state",
                correlation.as_ref().and_then(|c| c.state.as_deref()),
                credentials.state.as_deref(),
            )?;
        }

        let code = credentials.code.ok_or_else(|| {
            AuthError::InvalidMessage("callback carries no authorization code".to_string())
        })?;

        let pkce_verifier = match self.pkce_method {
            Some(_) => Some(
                correlation
                    .as_ref()
                    .and_then(|c| c.pkce_verifier.clone())
                    .ok_or_else(|| {
                        AuthError::StateMismatch("no PKCE verifier in session".to_string())
                    })?,
            ),
            None => None,
        };

        let expected_nonce = if self.config.use_nonce {
            Some(
                correlation
                    .as_ref()
                    .and_then(|c| c.nonce.clone())
                    .ok_or_else(|| AuthError::StateMismatch("no nonce in session".to_string()))?,
            )
        } else {
            None
        };

        let metadata = self.metadata().await?;
        let token_endpoint = token_endpoint(&metadata)?;

        let tokens = self
            .exchanger
            .exchange(
                token_endpoint,
                TokenGrant::AuthorizationCode {
                    code,
                    redirect_uri: self.config.redirect_uri.clone(),
                    pkce_verifier,
                },
            )
            .await?;

        let id_token = tokens.id_token.clone().ok_or_else(|| {
            AuthError::InvalidMessage("token response carries no ID token".to_string())
        })?;

        let claims = self
            .validator
            .validate(&metadata, &id_token, expected_nonce.as_deref())?;

        build_profile(flow.client_name, claims, tokens)
    }

    /// Validate a back-channel logout token.
    pub async fn validate_logout_token(
        &self,
        token: &str,
        flow: &FlowServices<'_>,
    ) -> AuthResult<SessionKeyCredentials> {
        let metadata = self.metadata().await?;
        validate_logout_token(&self.validator, &metadata, flow.replay, token, Utc::now()).await
    }

    /// Renew tokens with the refresh grant.
    ///
    /// A returned ID token is validated without nonce and must name the same
    /// subject.
    pub async fn refresh(&self, profile: &UserProfile) -> AuthResult<UserProfile> {
        let material = profile
            .oidc()
            .ok_or_else(|| AuthError::Unsupported("profile was not issued by OIDC".to_string()))?;
        let refresh_token = material.refresh_token.clone().ok_or_else(|| {
            AuthError::InvalidMessage("profile holds no refresh token".to_string())
        })?;

        let metadata = self.metadata().await?;
        let tokens = self
            .exchanger
            .exchange(
                token_endpoint(&metadata)?,
                TokenGrant::RefreshToken { refresh_token },
            )
            .await?;

        let mut refreshed = profile.clone();
        let mut material = material.clone();

        if let Some(id_token) = &tokens.id_token {
            let claims = self.validator.validate(&metadata, id_token, None)?;
            if claims.sub != profile.id {
                return Err(AuthError::InvalidClaim(format!(
                    "refreshed ID token is for {} instead of {}",
                    claims.sub, profile.id
                )));
            }
            refreshed.attributes.extend(claims.additional);
            material.id_token = Some(id_token.clone());
            if claims.sid.is_some() {
                material.sid = claims.sid;
            }
        }

        material.access_token = Some(tokens.access_token);
        if tokens.refresh_token.is_some() {
            material.refresh_token = tokens.refresh_token;
        }
        material.expires_at = token_expiry(tokens.expires_in)?;

        refreshed.material = ProtocolMaterial::Oidc(material);
        tracing::debug!(subject = %refreshed.id, "Tokens refreshed");
        Ok(refreshed)
    }

    /// RP-initiated logout redirect to the provider's end session endpoint.
    pub async fn build_logout_redirect(
        &self,
        profile: Option<&UserProfile>,
        flow: &FlowServices<'_>,
    ) -> AuthResult<RedirectInstruction> {
        let metadata = self.metadata().await?;
        let end_session = metadata.end_session_endpoint.as_deref().ok_or_else(|| {
            AuthError::Unsupported("provider has no end_session_endpoint".to_string())
        })?;

        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(id_token) = profile.and_then(|p| p.oidc()).and_then(|m| m.id_token.clone()) {
            params.push(("id_token_hint", id_token));
        }
        params.push(("client_id", self.config.client_id.clone()));
        if let Some(uri) = &self.config.post_logout_redirect_uri {
            params.push(("post_logout_redirect_uri", uri.clone()));
        }
        params.push(("state", flow.generator.generate(ValuePurpose::State)));

        Ok(RedirectInstruction::Location(append_query(end_session, &params)))
    }
}

fn token_endpoint(metadata: &ProviderMetadata) -> AuthResult<&str> {
    metadata
        .token_endpoint
        .as_deref()
        .ok_or_else(|| AuthError::Configuration("provider metadata has no token_endpoint".to_string()))
}

/// Absolute expiry of an access token issued now with `expires_in` seconds.
fn token_expiry(expires_in: Option<i64>) -> AuthResult<Option<DateTime<Utc>>> {
    expires_in
        .map(|secs| {
            Duration::try_seconds(secs)
                .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                .ok_or_else(|| {
                    AuthError::InvalidMessage(format!("expires_in {} is out of range", secs))
                })
        })
        .transpose()
}

fn build_profile(
    client_name: &str,
    claims: IdTokenClaims,
    tokens: TokenResponse,
) -> AuthResult<UserProfile> {
    let expires_at = token_expiry(tokens.expires_in)?;

    let material = OidcMaterial {
        issuer: claims.iss.clone(),
        id_token: tokens.id_token,
        access_token: Some(tokens.access_token),
        refresh_token: tokens.refresh_token,
        expires_at,
        sid: claims.sid.clone(),
    };

    let mut profile = UserProfile::new(claims.sub, client_name, ProtocolMaterial::Oidc(material));
    profile.attributes = claims.additional;
    if let Some(auth_time) = claims.auth_time {
        profile
            .attributes
            .insert("auth_time".to_string(), serde_json::Value::from(auth_time));
    }
    Ok(profile)
}
