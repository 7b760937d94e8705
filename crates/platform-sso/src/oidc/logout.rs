//! OIDC back-channel logout tokens.
//!
//! A logout token is a JWT POSTed by the provider. It is checked like an ID
//! token (signature, issuer, audience) plus the logout specific rules:
//! `events` names the back-channel logout event, `nonce` is absent, `sid` or
//! `sub` is present, and `jti` is accepted only once.

use crate::credentials::{LogoutType, SessionKeyCredentials};
use crate::error::{AuthError, AuthResult};
use crate::oidc::metadata::ProviderMetadata;
use crate::oidc::token_validator::{Audience, TokenValidator};
use chrono::{DateTime, Duration, TimeZone, Utc};
use platform_replay::ReplayCache;
use serde::Deserialize;

/// Event type URI carried in `events`.
pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Oldest logout token accepted, measured from `iat`.
pub const LOGOUT_TOKEN_MAX_AGE_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct LogoutTokenClaims {
    iss: String,
    aud: Audience,
    iat: i64,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    events: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    nonce: Option<serde_json::Value>,
}

/// Validate a back-channel logout token and extract the session it names.
pub async fn validate_logout_token(
    validator: &TokenValidator,
    metadata: &ProviderMetadata,
    replay: &dyn ReplayCache,
    token: &str,
    now: DateTime<Utc>,
) -> AuthResult<SessionKeyCredentials> {
    let raw = validator.verify_signature(metadata, token)?;
    let claims: LogoutTokenClaims = serde_json::from_value(raw)
        .map_err(|e| AuthError::InvalidMessage(format!("malformed logout token: {}", e)))?;

    validator.check_issuer_and_audience(metadata, &claims.iss, &claims.aud, None)?;
    validator.check_issued_at(claims.iat, now)?;

    let oldest = now - Duration::seconds(LOGOUT_TOKEN_MAX_AGE_SECS) - validator.clock_skew();
    if claims.iat < oldest.timestamp() {
        return Err(AuthError::ExpiredOrNotYetValid(format!(
            "logout token issued too long ago ({})",
            claims.iat
        )));
    }

    if let Some(exp) = claims.exp {
        if exp <= now.timestamp() {
            return Err(AuthError::ExpiredOrNotYetValid(format!(
                "logout token expired at {}",
                exp
            )));
        }
    }

    let has_event = claims
        .events
        .as_ref()
        .is_some_and(|events| events.contains_key(BACKCHANNEL_LOGOUT_EVENT));
    if !has_event {
        return Err(AuthError::InvalidMessage(
            "logout token does not carry the back-channel logout event".to_string(),
        ));
    }

    if claims.nonce.is_some() {
        return Err(AuthError::InvalidMessage(
            "logout token must not contain a nonce".to_string(),
        ));
    }

    let session_key = claims
        .sid
        .clone()
        .or_else(|| claims.sub.clone())
        .ok_or_else(|| {
            AuthError::InvalidMessage("logout token names neither sid nor sub".to_string())
        })?;

    let jti = claims
        .jti
        .as_deref()
        .filter(|j| !j.is_empty())
        .ok_or_else(|| AuthError::InvalidMessage("logout token has no jti".to_string()))?;

    let replay_until = claims
        .exp
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
        .unwrap_or_else(|| {
            now + Duration::seconds(LOGOUT_TOKEN_MAX_AGE_SECS) + validator.clock_skew()
        });

    let replay_key = format!("oidc-logout:{}:{}", claims.iss, jti);
    if !replay.check_and_insert(&replay_key, replay_until).await? {
        tracing::warn!(jti = %jti, "Replayed logout token rejected");
        return Err(AuthError::Replay(format!("logout token {} already used", jti)));
    }

    Ok(SessionKeyCredentials::new(session_key, LogoutType::BackChannel).with_issuer(claims.iss))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::config::OidcClientConfig;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use platform_replay::MemoryReplayCache;
    use serde_json::json;

    const ISSUER: &str = "https://op.example.com";
    const SECRET: &str = "logout-secret-with-enough-bytes-000";

    fn setup() -> (TokenValidator, ProviderMetadata) {
        let mut metadata = ProviderMetadata::new(ISSUER, "https://op.example.com/authorize");
        metadata.id_token_signing_alg_values_supported = vec!["HS256".to_string()];
        let config = OidcClientConfig::new("app", "https://app.example.com/cb").with_secret(SECRET);
        (TokenValidator::new(&config, &metadata).unwrap(), metadata)
    }

    fn token(claims: serde_json::Value) -> String {
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
            "aud": "app",
            "iat": now.timestamp(),
            "jti": "jti-1",
            "sid": "sid-1",
            "events": { BACKCHANNEL_LOGOUT_EVENT: {} }
        })
    }

    #[tokio::test]
    async fn test_valid_logout_token() {
        let (validator, metadata) = setup();
        let replay = MemoryReplayCache::new();
        let now = Utc::now();

        let creds = validate_logout_token(&validator, &metadata, &replay, &token(claims(now)), now)
            .await
            .unwrap();

        assert_eq!(creds.session_key, "sid-1");
        assert_eq!(creds.logout_type, LogoutType::BackChannel);
        assert_eq!(creds.issuer.as_deref(), Some(ISSUER));
    }

    #[tokio::test]
    async fn test_logout_token_replay() {
        let (validator, metadata) = setup();
        let replay = MemoryReplayCache::new();
        let now = Utc::now();
        let logout_token = token(claims(now));

        assert!(validate_logout_token(&validator, &metadata, &replay, &logout_token, now)
            .await
            .is_ok());
        assert!(matches!(
            validate_logout_token(&validator, &metadata, &replay, &logout_token, now).await,
            Err(AuthError::Replay(_))
        ));
    }

    #[tokio::test]
    async fn test_logout_token_rules() {
        let (validator, metadata) = setup();
        let replay = MemoryReplayCache::new();
        let now = Utc::now();

        let mut with_nonce = claims(now);
        with_nonce["nonce"] = json!("n1");
        with_nonce["jti"] = json!("jti-2");
        assert!(validate_logout_token(&validator, &metadata, &replay, &token(with_nonce), now)
            .await
            .is_err());

        let mut no_event = claims(now);
        no_event["events"] = json!({});
        no_event["jti"] = json!("jti-3");
        assert!(validate_logout_token(&validator, &metadata, &replay, &token(no_event), now)
            .await
            .is_err());

        let mut anonymous = claims(now);
        anonymous.as_object_mut().unwrap().remove("sid");
        anonymous["jti"] = json!("jti-4");
        assert!(validate_logout_token(&validator, &metadata, &replay, &token(anonymous), now)
            .await
            .is_err());

        let mut stale = claims(now);
        stale["iat"] = json!(now.timestamp() - LOGOUT_TOKEN_MAX_AGE_SECS - 121);
        stale["jti"] = json!("jti-5");
        assert!(matches!(
            validate_logout_token(&validator, &metadata, &replay, &token(stale), now).await,
            Err(AuthError::ExpiredOrNotYetValid(_))
        ));

        let mut expired = claims(now);
        expired["exp"] = json!(now.timestamp() - 1);
        expired["jti"] = json!("jti-6");
        assert!(matches!(
            validate_logout_token(&validator, &metadata, &replay, &token(expired), now).await,
            Err(AuthError::ExpiredOrNotYetValid(_))
        ));
    }

    #[tokio::test]
    async fn test_subject_only_logout_token() {
        let (validator, metadata) = setup();
        let replay = MemoryReplayCache::new();
        let now = Utc::now();

        let mut by_subject = claims(now);
        by_subject.as_object_mut().unwrap().remove("sid");
        by_subject["sub"] = json!("alice");

        let creds = validate_logout_token(&validator, &metadata, &replay, &token(by_subject), now)
            .await
            .unwrap();
        assert_eq!(creds.session_key, "alice");
    }
}
