//! Correlation value generation
//!
//! State, nonce, PKCE verifiers and SAML message identifiers all come from a
//! [`ValueGenerator`]. Production code uses [`SecureValueGenerator`], which
//! draws from the operating system CSPRNG; tests may plug in a deterministic
//! implementation.

use crate::error::{AuthError, AuthResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What a generated value will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValuePurpose {
    /// CSRF state / SAML RelayState
    State,
    /// OIDC nonce
    Nonce,
    /// PKCE code verifier
    PkceVerifier,
    /// SAML protocol message ID
    MessageId,
    /// JWT `jti` of a client assertion
    TokenId,
}

/// Source of correlation values.
pub trait ValueGenerator: Send + Sync {
    /// Generate a fresh URL-safe value.
    fn generate(&self, purpose: ValuePurpose) -> String;
}

/// Minimum entropy accepted for correlation values (160 bits).
pub const MIN_ENTROPY_BYTES: usize = 20;

/// CSPRNG-backed generator.
#[derive(Debug, Clone)]
pub struct SecureValueGenerator {
    entropy_bytes: usize,
}

impl SecureValueGenerator {
    /// Create a generator producing 256-bit values.
    pub fn new() -> Self {
        Self { entropy_bytes: 32 }
    }

    /// Create a generator with a custom entropy size.
    ///
    /// Fails when fewer than [`MIN_ENTROPY_BYTES`] bytes are requested.
    pub fn with_entropy_bytes(entropy_bytes: usize) -> AuthResult<Self> {
        if entropy_bytes < MIN_ENTROPY_BYTES {
            return Err(AuthError::Configuration(format!(
                "correlation values need at least {} bytes of entropy, got {}",
                MIN_ENTROPY_BYTES, entropy_bytes
            )));
        }
        Ok(Self { entropy_bytes })
    }
}

impl Default for SecureValueGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueGenerator for SecureValueGenerator {
    fn generate(&self, purpose: ValuePurpose) -> String {
        let mut bytes = vec![0u8; self.entropy_bytes];
        OsRng.fill_bytes(&mut bytes);
        let value = URL_SAFE_NO_PAD.encode(&bytes);

        match purpose {
            // xs:ID must not start with a digit or '-'
            ValuePurpose::MessageId => format!("_{}", value),
            _ => value,
        }
    }
}

/// PKCE code challenge method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PkceMethod {
    /// SHA-256 of the verifier
    S256,
    /// Verifier sent as-is
    #[serde(rename = "plain")]
    Plain,
}

impl PkceMethod {
    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            PkceMethod::S256 => "S256",
            PkceMethod::Plain => "plain",
        }
    }

    /// Compute the code challenge for a verifier.
    pub fn challenge(&self, verifier: &str) -> String {
        match self {
            PkceMethod::S256 => {
                let mut hasher = Sha256::new();
                hasher.update(verifier.as_bytes());
                let hash = hasher.finalize();
                URL_SAFE_NO_PAD.encode(hash)
            }
            PkceMethod::Plain => verifier.to_string(),
        }
    }
}
