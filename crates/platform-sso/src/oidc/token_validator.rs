//! ID token validation
//!
//! The set of acceptable signing algorithms is negotiated once, when the
//! validator is built, and frozen for its lifetime. Keys are taken from the
//! provider metadata snapshot passed to each call so key rotation needs no
//! rebuild.

use crate::error::{AuthError, AuthResult};
use crate::jose::{self, JwsAlgorithm, KeyFamily};
use crate::oidc::config::OidcClientConfig;
use crate::oidc::metadata::ProviderMetadata;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    /// Single audience
    Single(String),
    /// Several audiences
    Multiple(Vec<String>),
}

impl Audience {
    /// Whether the audience includes `client_id`.
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == client_id,
            Audience::Multiple(auds) => auds.iter().any(|a| a == client_id),
        }
    }

    /// Number of audiences.
    pub fn len(&self) -> usize {
        match self {
            Audience::Single(_) => 1,
            Audience::Multiple(auds) => auds.len(),
        }
    }

    /// Whether no audience is listed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Claims of a validated ID token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer
    pub iss: String,

    /// Subject
    pub sub: String,

    /// Audience
    pub aud: Audience,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Nonce echoed from the authorization request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Authorized party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,

    /// Provider session ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    /// Time of end-user authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,

    /// Every other claim
    #[serde(default, flatten)]
    pub additional: HashMap<String, serde_json::Value>,
}

/// Decide which ID token algorithms to accept.
///
/// A configured preference must be advertised by the provider. Without one,
/// every advertised algorithm is accepted, minus `none` unless explicitly
/// allowed and minus HMAC algorithms when there is no client secret to
/// verify them with.
pub fn negotiate_algorithms(
    preferred: Option<JwsAlgorithm>,
    advertised: &[JwsAlgorithm],
    allow_unsigned: bool,
    has_client_secret: bool,
) -> AuthResult<Vec<JwsAlgorithm>> {
    let usable = |alg: &JwsAlgorithm| match alg.family() {
        KeyFamily::Unsigned => allow_unsigned,
        KeyFamily::Hmac => has_client_secret,
        _ => true,
    };

    if let Some(preferred) = preferred {
        if !advertised.contains(&preferred) {
            return Err(AuthError::Configuration(format!(
                "preferred algorithm {} is not supported by the provider (advertised: {})",
                preferred,
                join(advertised)
            )));
        }
        if !usable(&preferred) {
            return Err(AuthError::Configuration(format!(
                "preferred algorithm {} cannot be used with this client configuration",
                preferred
            )));
        }
        return Ok(vec![preferred]);
    }

    let mut accepted: Vec<JwsAlgorithm> = Vec::new();
    for alg in advertised.iter().filter(|alg| usable(alg)) {
        if !accepted.contains(alg) {
            accepted.push(*alg);
        }
    }

    if accepted.is_empty() {
        return Err(AuthError::Configuration(format!(
            "no usable ID token signing algorithm among: {}",
            join(advertised)
        )));
    }

    Ok(accepted)
}

fn join(algs: &[JwsAlgorithm]) -> String {
    algs.iter()
        .map(JwsAlgorithm::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validates ID tokens (and the JWS part of logout tokens).
pub struct TokenValidator {
    algorithms: Vec<JwsAlgorithm>,
    client_id: String,
    client_secret: Option<String>,
    clock_skew: Duration,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithms", &self.algorithms)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("clock_skew", &self.clock_skew)
            .finish()
    }
}

impl TokenValidator {
    /// Build a validator, negotiating algorithms against the provider.
    pub fn new(config: &OidcClientConfig, metadata: &ProviderMetadata) -> AuthResult<Self> {
        let algorithms = negotiate_algorithms(
            config.preferred_jws_algorithm,
            &metadata.id_token_algorithms(),
            config.allow_unsigned_id_tokens,
            config.client_secret.is_some(),
        )?;

        tracing::debug!(
            client_id = %config.client_id,
            algorithms = %join(&algorithms),
            "ID token algorithms negotiated"
        );

        Ok(Self {
            algorithms,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            clock_skew: Duration::seconds(config.clock_skew_secs),
        })
    }

    /// Accepted algorithms, in the order they are tried.
    pub fn algorithms(&self) -> &[JwsAlgorithm] {
        &self.algorithms
    }

    /// Configured clock skew tolerance.
    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Validate an ID token at the current time.
    pub fn validate(
        &self,
        metadata: &ProviderMetadata,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> AuthResult<IdTokenClaims> {
        self.validate_at(metadata, id_token, expected_nonce, Utc::now())
    }

    /// Validate an ID token against a given instant.
    ///
    /// Checks, in order: signature, issuer, audience, expiry, issue time and
    /// nonce.
    pub fn validate_at(
        &self,
        metadata: &ProviderMetadata,
        id_token: &str,
        expected_nonce: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<IdTokenClaims> {
        let raw_claims = self.verify_signature(metadata, id_token)?;

        let claims: IdTokenClaims = serde_json::from_value(raw_claims)
            .map_err(|e| AuthError::InvalidMessage(format!("malformed ID token claims: {}", e)))?;

        self.check_issuer_and_audience(metadata, &claims.iss, &claims.aud, claims.azp.as_deref())?;

        if claims.exp <= now.timestamp() {
            return Err(AuthError::ExpiredOrNotYetValid(format!(
                "ID token expired at {}",
                claims.exp
            )));
        }

        self.check_issued_at(claims.iat, now)?;

        if let Some(expected) = expected_nonce {
            match claims.nonce.as_deref() {
                Some(nonce) if nonce.as_bytes() == expected.as_bytes() => {}
                Some(_) => {
                    return Err(AuthError::StateMismatch(
                        "ID token nonce does not match".to_string(),
                    ))
                }
                None => {
                    return Err(AuthError::StateMismatch(
                        "ID token carries no nonce".to_string(),
                    ))
                }
            }
        }

        Ok(claims)
    }

    /// Verify the JWS signature and return the raw claims.
    ///
    /// The token's `alg` must be one of the negotiated algorithms. Keys are
    /// chosen by `kid`, or every signature key fitting the algorithm is
    /// tried when the header has none.
    pub fn verify_signature(
        &self,
        metadata: &ProviderMetadata,
        token: &str,
    ) -> AuthResult<serde_json::Value> {
        let header = jose::peek_header(token)?;

        let alg = JwsAlgorithm::parse(&header.alg)
            .filter(|alg| self.algorithms.contains(alg))
            .ok_or_else(|| {
                tracing::warn!(alg = %header.alg, "Token signed with an algorithm that is not accepted");
                AuthError::Signature(format!("algorithm {} is not accepted", header.alg))
            })?;

        match alg.family() {
            KeyFamily::Unsigned => jose::unsigned_payload(token),
            KeyFamily::Hmac => {
                let secret = self.client_secret.as_ref().ok_or_else(|| {
                    AuthError::Signature("no client secret to verify HMAC token".to_string())
                })?;
                jose::verify_signature(token, alg, &DecodingKey::from_secret(secret.as_bytes()))
            }
            _ => self.verify_with_provider_keys(metadata, token, alg, header.kid.as_deref()),
        }
    }

    fn verify_with_provider_keys(
        &self,
        metadata: &ProviderMetadata,
        token: &str,
        alg: JwsAlgorithm,
        kid: Option<&str>,
    ) -> AuthResult<serde_json::Value> {
        let candidates: Vec<_> = metadata
            .keys
            .iter()
            .filter(|key| key.supports(alg))
            .filter(|key| kid.map_or(true, |kid| key.kid.as_deref() == Some(kid)))
            .collect();

        if candidates.is_empty() {
            tracing::warn!(alg = %alg, kid = ?kid, "No provider key matches token");
            return Err(AuthError::Signature(format!(
                "no {} key{} in provider key set",
                alg,
                kid.map(|k| format!(" with kid {}", k)).unwrap_or_default()
            )));
        }

        let mut last_error = None;
        for key in candidates {
            let decoding_key = match key.decoding_key() {
                Ok(k) => k,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unusable provider key");
                    last_error = Some(e);
                    continue;
                }
            };
            match jose::verify_signature(token, alg, &decoding_key) {
                Ok(claims) => return Ok(claims),
                Err(e) => last_error = Some(e),
            }
        }

        tracing::warn!(alg = %alg, "Token signature did not verify with any provider key");
        Err(last_error
            .unwrap_or_else(|| AuthError::Signature("signature verification failed".to_string())))
    }

    /// Check `iss` equals the provider issuer and `aud` names this client.
    pub fn check_issuer_and_audience(
        &self,
        metadata: &ProviderMetadata,
        iss: &str,
        aud: &Audience,
        azp: Option<&str>,
    ) -> AuthResult<()> {
        if iss != metadata.issuer {
            return Err(AuthError::InvalidClaim(format!(
                "issuer {} does not match {}",
                iss, metadata.issuer
            )));
        }

        if !aud.contains(&self.client_id) {
            return Err(AuthError::InvalidClaim(format!(
                "audience does not include {}",
                self.client_id
            )));
        }

        if let Some(azp) = azp {
            if aud.len() > 1 && azp != self.client_id {
                return Err(AuthError::InvalidClaim(format!(
                    "authorized party {} is not this client",
                    azp
                )));
            }
        }

        Ok(())
    }

    /// Check `iat` is not in the future beyond the clock skew.
    pub fn check_issued_at(&self, iat: i64, now: DateTime<Utc>) -> AuthResult<()> {
        if iat > (now + self.clock_skew).timestamp() {
            return Err(AuthError::ExpiredOrNotYetValid(format!(
                "token issued in the future ({})",
                iat
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    const ISSUER: &str = "https://op.example.com";
    const SECRET: &str = "client-secret-with-enough-bytes-123456";

    fn metadata(algs: &[&str]) -> ProviderMetadata {
        let mut metadata = ProviderMetadata::new(ISSUER, "https://op.example.com/authorize");
        metadata.id_token_signing_alg_values_supported =
            algs.iter().map(|s| s.to_string()).collect();
        metadata
    }

    fn config() -> OidcClientConfig {
        OidcClientConfig::new("app", "https://app.example.com/callback").with_secret(SECRET)
    }

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn claims(now: DateTime<Utc>) -> serde_json::Value {
        json!({
            "iss": ISSUER,
            "sub": "alice",
            "aud": "app",
            "exp": now.timestamp() + 300,
            "iat": now.timestamp(),
            "nonce": "n1",
        })
    }

    #[test]
    fn test_negotiation_with_preference() {
        let advertised = [JwsAlgorithm::RS256, JwsAlgorithm::HS256];

        let algs = negotiate_algorithms(Some(JwsAlgorithm::RS256), &advertised, false, true)
            .unwrap();
        assert_eq!(algs, vec![JwsAlgorithm::RS256]);

        let all = negotiate_algorithms(None, &advertised, false, true).unwrap();
        assert_eq!(all, vec![JwsAlgorithm::RS256, JwsAlgorithm::HS256]);

        let missing = negotiate_algorithms(Some(JwsAlgorithm::ES256), &advertised, false, true);
        assert!(matches!(missing, Err(AuthError::Configuration(_))));
    }

    #[test]
    fn test_negotiation_excludes_none_by_default() {
        let advertised = [JwsAlgorithm::None];
        assert!(negotiate_algorithms(None, &advertised, false, false).is_err());
        assert_eq!(
            negotiate_algorithms(None, &advertised, true, false).unwrap(),
            vec![JwsAlgorithm::None]
        );

        let mixed = [JwsAlgorithm::RS256, JwsAlgorithm::None, JwsAlgorithm::HS256];
        assert_eq!(
            negotiate_algorithms(None, &mixed, false, false).unwrap(),
            vec![JwsAlgorithm::RS256]
        );
    }

    #[test]
    fn test_valid_token() {
        let now = Utc::now();
        let metadata = metadata(&["HS256"]);
        let validator = TokenValidator::new(&config(), &metadata).unwrap();

        let claims = validator
            .validate_at(&metadata, &sign(claims(now)), Some("n1"), now)
            .unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn test_expiry_boundaries() {
        let now = Utc::now();
        let metadata = metadata(&["HS256"]);
        let validator = TokenValidator::new(&config(), &metadata).unwrap();

        let mut expired = claims(now);
        expired["exp"] = json!(now.timestamp() - 1);
        assert!(matches!(
            validator.validate_at(&metadata, &sign(expired), Some("n1"), now),
            Err(AuthError::ExpiredOrNotYetValid(_))
        ));

        let mut fresh = claims(now);
        fresh["exp"] = json!(now.timestamp() + 1);
        assert!(validator
            .validate_at(&metadata, &sign(fresh), Some("n1"), now)
            .is_ok());
    }

    #[test]
    fn test_issued_at_skew() {
        let now = Utc::now();
        let metadata = metadata(&["HS256"]);
        let validator = TokenValidator::new(&config(), &metadata).unwrap();

        let mut within = claims(now);
        within["iat"] = json!(now.timestamp() + 120);
        assert!(validator
            .validate_at(&metadata, &sign(within), Some("n1"), now)
            .is_ok());

        let mut beyond = claims(now);
        beyond["iat"] = json!(now.timestamp() + 121);
        assert!(matches!(
            validator.validate_at(&metadata, &sign(beyond), Some("n1"), now),
            Err(AuthError::ExpiredOrNotYetValid(_))
        ));
    }

    #[test]
    fn test_issuer_and_audience() {
        let now = Utc::now();
        let metadata = metadata(&["HS256"]);
        let validator = TokenValidator::new(&config(), &metadata).unwrap();

        let mut wrong_issuer = claims(now);
        wrong_issuer["iss"] = json!("https://op.example.com/");
        assert!(matches!(
            validator.validate_at(&metadata, &sign(wrong_issuer), Some("n1"), now),
            Err(AuthError::InvalidClaim(_))
        ));

        let mut other_audience = claims(now);
        other_audience["aud"] = json!(["other-app"]);
        assert!(matches!(
            validator.validate_at(&metadata, &sign(other_audience), Some("n1"), now),
            Err(AuthError::InvalidClaim(_))
        ));

        let mut multi = claims(now);
        multi["aud"] = json!(["app", "other-app"]);
        multi["azp"] = json!("other-app");
        assert!(validator
            .validate_at(&metadata, &sign(multi), Some("n1"), now)
            .is_err());
    }

    #[test]
    fn test_nonce_binding() {
        let now = Utc::now();
        let metadata = metadata(&["HS256"]);
        let validator = TokenValidator::new(&config(), &metadata).unwrap();

        assert!(matches!(
            validator.validate_at(&metadata, &sign(claims(now)), Some("n2"), now),
            Err(AuthError::StateMismatch(_))
        ));

        let mut no_nonce = claims(now);
        no_nonce.as_object_mut().unwrap().remove("nonce");
        assert!(matches!(
            validator.validate_at(&metadata, &sign(no_nonce.clone()), Some("n1"), now),
            Err(AuthError::StateMismatch(_))
        ));

        // Refresh responses carry no nonce and none is expected
        assert!(validator
            .validate_at(&metadata, &sign(no_nonce), None, now)
            .is_ok());
    }

    #[test]
    fn test_rejects_unaccepted_algorithm() {
        let now = Utc::now();
        let metadata = metadata(&["RS256", "HS256"]);
        let mut config = config();
        config.preferred_jws_algorithm = Some(JwsAlgorithm::RS256);
        let validator = TokenValidator::new(&config, &metadata).unwrap();

        assert!(matches!(
            validator.validate_at(&metadata, &sign(claims(now)), Some("n1"), now),
            Err(AuthError::Signature(_))
        ));
    }

    #[test]
    fn test_unsigned_token_requires_opt_in() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let now = Utc::now();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims(now).to_string());
        let token = format!("{}.{}.", header, payload);

        let metadata = metadata(&["RS256", "none"]);
        let strict = TokenValidator::new(&config(), &metadata).unwrap();
        assert!(matches!(
            strict.validate_at(&metadata, &token, Some("n1"), now),
            Err(AuthError::Signature(_))
        ));

        let mut permissive_config = config();
        permissive_config.allow_unsigned_id_tokens = true;
        let permissive = TokenValidator::new(&permissive_config, &metadata).unwrap();
        assert!(permissive
            .validate_at(&metadata, &token, Some("n1"), now)
            .is_ok());
    }

    #[test]
    fn test_tampered_signature() {
        let now = Utc::now();
        let metadata = metadata(&["HS256"]);
        let validator = TokenValidator::new(&config(), &metadata).unwrap();

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims(now),
            &EncodingKey::from_secret(b"attacker-secret"),
        )
        .unwrap();
        assert!(matches!(
            validator.validate_at(&metadata, &token, Some("n1"), now),
            Err(AuthError::Signature(_))
        ));
    }
}
