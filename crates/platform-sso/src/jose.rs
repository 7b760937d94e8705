//! JOSE helpers
//!
//! Signature primitives come from the `jsonwebtoken` crate. This module maps
//! provider key material and algorithm names onto it, and reads compact JWS
//! headers without trusting them.

use crate::error::{AuthError, AuthResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// JWS signing algorithms understood by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JwsAlgorithm {
    /// HMAC using SHA-256
    HS256,
    /// HMAC using SHA-384
    HS384,
    /// HMAC using SHA-512
    HS512,
    /// RSASSA-PKCS1-v1_5 using SHA-256
    RS256,
    /// RSASSA-PKCS1-v1_5 using SHA-384
    RS384,
    /// RSASSA-PKCS1-v1_5 using SHA-512
    RS512,
    /// RSASSA-PSS using SHA-256
    PS256,
    /// RSASSA-PSS using SHA-384
    PS384,
    /// RSASSA-PSS using SHA-512
    PS512,
    /// ECDSA using P-256 and SHA-256
    ES256,
    /// ECDSA using P-384 and SHA-384
    ES384,
    /// Edwards-curve signatures
    EdDSA,
    /// Unsigned
    #[serde(rename = "none")]
    None,
}

/// Key family an algorithm needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// Shared secret
    Hmac,
    /// RSA public key
    Rsa,
    /// EC public key
    Ec,
    /// Ed25519 public key
    Ed,
    /// No key at all
    Unsigned,
}

impl JwsAlgorithm {
    /// Parse from the JOSE `alg` name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HS256" => Some(JwsAlgorithm::HS256),
            "HS384" => Some(JwsAlgorithm::HS384),
            "HS512" => Some(JwsAlgorithm::HS512),
            "RS256" => Some(JwsAlgorithm::RS256),
            "RS384" => Some(JwsAlgorithm::RS384),
            "RS512" => Some(JwsAlgorithm::RS512),
            "PS256" => Some(JwsAlgorithm::PS256),
            "PS384" => Some(JwsAlgorithm::PS384),
            "PS512" => Some(JwsAlgorithm::PS512),
            "ES256" => Some(JwsAlgorithm::ES256),
            "ES384" => Some(JwsAlgorithm::ES384),
            "EdDSA" => Some(JwsAlgorithm::EdDSA),
            "none" => Some(JwsAlgorithm::None),
            _ => None,
        }
    }

    /// JOSE `alg` name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JwsAlgorithm::HS256 => "HS256",
            JwsAlgorithm::HS384 => "HS384",
            JwsAlgorithm::HS512 => "HS512",
            JwsAlgorithm::RS256 => "RS256",
            JwsAlgorithm::RS384 => "RS384",
            JwsAlgorithm::RS512 => "RS512",
            JwsAlgorithm::PS256 => "PS256",
            JwsAlgorithm::PS384 => "PS384",
            JwsAlgorithm::PS512 => "PS512",
            JwsAlgorithm::ES256 => "ES256",
            JwsAlgorithm::ES384 => "ES384",
            JwsAlgorithm::EdDSA => "EdDSA",
            JwsAlgorithm::None => "none",
        }
    }

    /// Key family this algorithm verifies with.
    pub fn family(&self) -> KeyFamily {
        match self {
            JwsAlgorithm::HS256 | JwsAlgorithm::HS384 | JwsAlgorithm::HS512 => KeyFamily::Hmac,
            JwsAlgorithm::RS256
            | JwsAlgorithm::RS384
            | JwsAlgorithm::RS512
            | JwsAlgorithm::PS256
            | JwsAlgorithm::PS384
            | JwsAlgorithm::PS512 => KeyFamily::Rsa,
            JwsAlgorithm::ES256 | JwsAlgorithm::ES384 => KeyFamily::Ec,
            JwsAlgorithm::EdDSA => KeyFamily::Ed,
            JwsAlgorithm::None => KeyFamily::Unsigned,
        }
    }

    /// Corresponding `jsonwebtoken` algorithm; `None` for unsigned.
    pub fn to_jsonwebtoken(&self) -> Option<Algorithm> {
        match self {
            JwsAlgorithm::HS256 => Some(Algorithm::HS256),
            JwsAlgorithm::HS384 => Some(Algorithm::HS384),
            JwsAlgorithm::HS512 => Some(Algorithm::HS512),
            JwsAlgorithm::RS256 => Some(Algorithm::RS256),
            JwsAlgorithm::RS384 => Some(Algorithm::RS384),
            JwsAlgorithm::RS512 => Some(Algorithm::RS512),
            JwsAlgorithm::PS256 => Some(Algorithm::PS256),
            JwsAlgorithm::PS384 => Some(Algorithm::PS384),
            JwsAlgorithm::PS512 => Some(Algorithm::PS512),
            JwsAlgorithm::ES256 => Some(Algorithm::ES256),
            JwsAlgorithm::ES384 => Some(Algorithm::ES384),
            JwsAlgorithm::EdDSA => Some(Algorithm::EdDSA),
            JwsAlgorithm::None => None,
        }
    }
}

impl fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intended use of a provider key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyUse {
    /// `use: sig`
    #[serde(rename = "sig")]
    Signature,
    /// `use: enc`
    #[serde(rename = "enc")]
    Encryption,
}

/// Public key material as published by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyMaterial {
    /// PEM encoded RSA public key
    RsaPem {
        /// PEM text
        pem: String,
    },
    /// PEM encoded EC public key
    EcPem {
        /// PEM text
        pem: String,
    },
    /// PEM encoded Ed25519 public key
    EdPem {
        /// PEM text
        pem: String,
    },
    /// JWK RSA modulus and exponent (base64url)
    RsaComponents {
        /// Modulus
        n: String,
        /// Exponent
        e: String,
    },
    /// JWK EC coordinates (base64url)
    EcComponents {
        /// X coordinate
        x: String,
        /// Y coordinate
        y: String,
    },
}

impl KeyMaterial {
    fn family(&self) -> KeyFamily {
        match self {
            KeyMaterial::RsaPem { .. } | KeyMaterial::RsaComponents { .. } => KeyFamily::Rsa,
            KeyMaterial::EcPem { .. } | KeyMaterial::EcComponents { .. } => KeyFamily::Ec,
            KeyMaterial::EdPem { .. } => KeyFamily::Ed,
        }
    }
}

/// One signing key from the provider's key set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderKey {
    /// Key ID (`kid`)
    #[serde(default)]
    pub kid: Option<String>,

    /// Key use; keys without one are usable for signatures
    #[serde(default, rename = "use")]
    pub usage: Option<KeyUse>,

    /// Algorithm the key is restricted to
    #[serde(default)]
    pub alg: Option<JwsAlgorithm>,

    /// Key material
    pub material: KeyMaterial,
}

impl ProviderKey {
    /// Create a signature key.
    pub fn new(kid: Option<String>, material: KeyMaterial) -> Self {
        Self {
            kid,
            usage: Some(KeyUse::Signature),
            alg: None,
            material,
        }
    }

    /// Whether this key may verify signatures.
    pub fn is_signature_key(&self) -> bool {
        !matches!(self.usage, Some(KeyUse::Encryption))
    }

    /// Whether this key can verify tokens signed with `alg`.
    pub fn supports(&self, alg: JwsAlgorithm) -> bool {
        self.is_signature_key()
            && self.material.family() == alg.family()
            && self.alg.map_or(true, |restricted| restricted == alg)
    }

    /// Build the `jsonwebtoken` verification key.
    pub fn decoding_key(&self) -> AuthResult<DecodingKey> {
        let key = match &self.material {
            KeyMaterial::RsaPem { pem } => DecodingKey::from_rsa_pem(pem.as_bytes()),
            KeyMaterial::EcPem { pem } => DecodingKey::from_ec_pem(pem.as_bytes()),
            KeyMaterial::EdPem { pem } => DecodingKey::from_ed_pem(pem.as_bytes()),
            KeyMaterial::RsaComponents { n, e } => DecodingKey::from_rsa_components(n, e),
            KeyMaterial::EcComponents { x, y } => DecodingKey::from_ec_components(x, y),
        };

        key.map_err(|e| {
            AuthError::Configuration(format!(
                "Invalid provider key {}: {}",
                self.kid.as_deref().unwrap_or("<no kid>"),
                e
            ))
        })
    }
}

/// Unverified header of a compact JWS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwsHeader {
    /// Raw `alg` value
    pub alg: String,
    /// Key ID, when present
    pub kid: Option<String>,
}

/// Read the header of a compact JWS without verifying anything.
pub fn peek_header(token: &str) -> AuthResult<JwsHeader> {
    let header_segment = token
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::InvalidMessage("empty token".to_string()))?;

    let header: serde_json::Value = decode_segment(header_segment)?;

    let alg = header
        .get("alg")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::InvalidMessage("token header has no alg".to_string()))?
        .to_string();
    let kid = header
        .get("kid")
        .and_then(|v| v.as_str())
        .map(String::from);

    Ok(JwsHeader { alg, kid })
}

/// Payload of an unsigned (`alg: none`) token.
///
/// Fails when the token carries a signature segment.
pub fn unsigned_payload(token: &str) -> AuthResult<serde_json::Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 || !parts[2].is_empty() {
        return Err(AuthError::InvalidMessage(
            "unsigned token must have an empty signature segment".to_string(),
        ));
    }
    decode_segment(parts[1])
}

fn decode_segment(segment: &str) -> AuthResult<serde_json::Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| AuthError::InvalidMessage(format!("invalid token encoding: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::InvalidMessage(format!("invalid token JSON: {}", e)))
}

/// Verify a JWS signature and return its claims.
///
/// Only the signature is checked; time and audience checks are the caller's.
pub fn verify_signature(
    token: &str,
    alg: JwsAlgorithm,
    key: &DecodingKey,
) -> AuthResult<serde_json::Value> {
    let jwt_alg = alg.to_jsonwebtoken().ok_or_else(|| {
        AuthError::Signature("unsigned token cannot be verified with a key".to_string())
    })?;

    let mut validation = Validation::new(jwt_alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    jsonwebtoken::decode::<serde_json::Value>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| AuthError::Signature(format!("{} signature rejected: {}", alg, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    #[test]
    fn test_algorithm_names() {
        for alg in [
            JwsAlgorithm::HS256,
            JwsAlgorithm::RS256,
            JwsAlgorithm::PS512,
            JwsAlgorithm::ES384,
            JwsAlgorithm::EdDSA,
            JwsAlgorithm::None,
        ] {
            assert_eq!(JwsAlgorithm::parse(alg.as_str()), Some(alg));
        }
        assert_eq!(JwsAlgorithm::parse("NONE"), None);
        assert!(JwsAlgorithm::None.to_jsonwebtoken().is_none());
    }

    #[test]
    fn test_key_support() {
        let key = ProviderKey::new(
            Some("k1".to_string()),
            KeyMaterial::RsaComponents {
                n: "AQAB".to_string(),
                e: "AQAB".to_string(),
            },
        );
        assert!(key.supports(JwsAlgorithm::RS256));
        assert!(key.supports(JwsAlgorithm::PS256));
        assert!(!key.supports(JwsAlgorithm::ES256));

        let enc = ProviderKey {
            usage: Some(KeyUse::Encryption),
            ..key
        };
        assert!(!enc.supports(JwsAlgorithm::RS256));
    }

    #[test]
    fn test_peek_header_and_verify() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".to_string());
        let token = encode(
            &header,
            &json!({"sub": "alice"}),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let peeked = peek_header(&token).unwrap();
        assert_eq!(peeked.alg, "HS256");
        assert_eq!(peeked.kid.as_deref(), Some("k1"));

        let claims = verify_signature(
            &token,
            JwsAlgorithm::HS256,
            &DecodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert_eq!(claims["sub"], "alice");

        let wrong = verify_signature(
            &token,
            JwsAlgorithm::HS256,
            &DecodingKey::from_secret(b"other"),
        );
        assert!(matches!(wrong, Err(AuthError::Signature(_))));
    }

    #[test]
    fn test_unsigned_payload() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"alice"}"#);

        let token = format!("{}.{}.", header, payload);
        assert_eq!(unsigned_payload(&token).unwrap()["sub"], "alice");

        let with_sig = format!("{}.{}.abc", header, payload);
        assert!(unsigned_payload(&with_sig).is_err());
    }
}
