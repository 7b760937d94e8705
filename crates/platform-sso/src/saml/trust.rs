//! Signature trust, decryption and request signing seams.
//!
//! XML-DSig canonicalization and XML encryption are provided by the
//! application through [`TrustEngine`] and [`Decrypter`]. The crate ships
//! [`PublicKeyTrustEngine`] and [`PrivateKeySigner`], which handle the
//! detached signatures of the HTTP-Redirect binding with plain public key
//! cryptography.

use crate::error::{AuthError, AuthResult};
use crate::saml::model::{EncryptedElement, XmlSignature};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};

/// XML-DSig signature method URIs.
pub mod algorithms {
    /// RSA with SHA-1; refused
    pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
    /// RSA with SHA-256
    pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
    /// RSA with SHA-384
    pub const RSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
    /// RSA with SHA-512
    pub const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
    /// ECDSA with SHA-256
    pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
    /// ECDSA with SHA-384
    pub const ECDSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384";
}

/// Map a signature method URI to a public key algorithm.
///
/// SHA-1 based methods are not accepted.
pub fn signature_algorithm(uri: &str) -> Option<Algorithm> {
    match uri {
        algorithms::RSA_SHA256 => Some(Algorithm::RS256),
        algorithms::RSA_SHA384 => Some(Algorithm::RS384),
        algorithms::RSA_SHA512 => Some(Algorithm::RS512),
        algorithms::ECDSA_SHA256 => Some(Algorithm::ES256),
        algorithms::ECDSA_SHA384 => Some(Algorithm::ES384),
        _ => None,
    }
}

/// Verification material for one asserting party.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchor {
    /// IdP entity ID
    pub entity_id: String,

    /// Signing certificates, base64 DER as found in metadata
    pub certificates: Vec<String>,

    /// Signing public keys, PEM (`PUBLIC KEY` / `RSA PUBLIC KEY`)
    pub public_keys: Vec<String>,
}

impl TrustAnchor {
    /// Create an anchor without keys.
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ..Default::default()
        }
    }

    /// Add a PEM public key.
    pub fn with_public_key(mut self, pem: impl Into<String>) -> Self {
        self.public_keys.push(pem.into());
        self
    }

    /// Add a base64 DER certificate.
    pub fn with_certificate(mut self, certificate: impl Into<String>) -> Self {
        self.certificates.push(certificate.into());
        self
    }
}

/// Supplies the verification material for an asserting party.
///
/// Lets key material live outside the metadata snapshot (an HSM-backed key
/// store, a pinned certificate list).
pub trait CredentialProvider: Send + Sync {
    /// Trust anchor for `entity_id`, if one is known.
    fn credential(&self, entity_id: &str) -> Option<TrustAnchor>;
}

/// A signature and the data it covers.
#[derive(Debug, Clone, Copy)]
pub enum SignedObject<'a> {
    /// Enveloped XML signature inside `document`, covering the element whose
    /// `ID` is `reference_id`
    Enveloped {
        /// Complete source text containing the signed element
        document: &'a str,
        /// ID the signature must reference
        reference_id: &'a str,
        /// Parsed signature
        signature: &'a XmlSignature,
    },

    /// HTTP-Redirect binding signature over the query string
    Detached {
        /// `SAMLRequest=..&RelayState=..&SigAlg=..`, as received
        signed_content: &'a str,
        /// `SigAlg` URI
        algorithm: &'a str,
        /// Raw signature bytes
        signature: &'a [u8],
    },
}

/// Decides whether a signature was produced by the trusted party.
///
/// `Ok(false)` means the signature does not verify; `Err` means it could
/// not be evaluated at all. Both are rejections.
pub trait TrustEngine: Send + Sync {
    /// Verify `object` against `anchor`.
    fn verify(&self, object: &SignedObject<'_>, anchor: &TrustAnchor) -> AuthResult<bool>;
}

/// Decrypts `EncryptedAssertion`, `EncryptedID` and `EncryptedAttribute`.
pub trait Decrypter: Send + Sync {
    /// Return the plaintext XML of the encrypted element.
    fn decrypt(&self, element: &EncryptedElement) -> AuthResult<String>;
}

/// Signs outbound requests.
pub trait RequestSigner: Send + Sync {
    /// Signature method URI.
    fn algorithm(&self) -> &str;

    /// Sign a redirect binding query string; returns raw signature bytes.
    fn sign_detached(&self, content: &[u8]) -> AuthResult<Vec<u8>>;

    /// Insert an enveloped signature over the element with `reference_id`.
    fn sign_enveloped(&self, xml: &str, reference_id: &str) -> AuthResult<String>;
}

/// Trust engine that checks detached signatures with PEM public keys.
///
/// Enveloped signatures need canonicalization and are refused.
#[derive(Debug, Clone, Default)]
pub struct PublicKeyTrustEngine;

impl PublicKeyTrustEngine {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }
}

fn decoding_key(pem: &str, algorithm: Algorithm) -> AuthResult<DecodingKey> {
    let key = match algorithm {
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem.as_bytes()),
        _ => DecodingKey::from_rsa_pem(pem.as_bytes()),
    };
    key.map_err(|e| AuthError::Configuration(format!("invalid IdP public key: {}", e)))
}

impl TrustEngine for PublicKeyTrustEngine {
    fn verify(&self, object: &SignedObject<'_>, anchor: &TrustAnchor) -> AuthResult<bool> {
        let SignedObject::Detached {
            signed_content,
            algorithm,
            signature,
        } = object
        else {
            return Err(AuthError::Unsupported(
                "enveloped XML signatures need an XML-DSig trust engine".to_string(),
            ));
        };

        let alg = signature_algorithm(algorithm).ok_or_else(|| {
            AuthError::Signature(format!("signature algorithm {} is not accepted", algorithm))
        })?;

        if anchor.public_keys.is_empty() {
            return Err(AuthError::Configuration(format!(
                "no signing keys configured for {}",
                anchor.entity_id
            )));
        }

        let encoded = URL_SAFE_NO_PAD.encode(signature);
        for pem in &anchor.public_keys {
            let key = decoding_key(pem, alg)?;
            if jsonwebtoken::crypto::verify(&encoded, signed_content.as_bytes(), &key, alg)
                .unwrap_or(false)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Request signer backed by a PEM private key.
pub struct PrivateKeySigner {
    key: EncodingKey,
    algorithm: Algorithm,
    uri: &'static str,
}

impl std::fmt::Debug for PrivateKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeySigner")
            .field("algorithm", &self.uri)
            .finish_non_exhaustive()
    }
}

impl PrivateKeySigner {
    /// RSA-SHA256 signer.
    pub fn rsa_sha256(pem: &str) -> AuthResult<Self> {
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::Configuration(format!("invalid SP private key: {}", e)))?;
        Ok(Self {
            key,
            algorithm: Algorithm::RS256,
            uri: algorithms::RSA_SHA256,
        })
    }

    /// ECDSA-SHA256 signer.
    pub fn ecdsa_sha256(pem: &str) -> AuthResult<Self> {
        let key = EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| AuthError::Configuration(format!("invalid SP private key: {}", e)))?;
        Ok(Self {
            key,
            algorithm: Algorithm::ES256,
            uri: algorithms::ECDSA_SHA256,
        })
    }
}

impl RequestSigner for PrivateKeySigner {
    fn algorithm(&self) -> &str {
        self.uri
    }

    fn sign_detached(&self, content: &[u8]) -> AuthResult<Vec<u8>> {
        let encoded = jsonwebtoken::crypto::sign(content, &self.key, self.algorithm)
            .map_err(|e| AuthError::Internal(format!("signing failed: {}", e)))?;
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| AuthError::Internal(format!("signing failed: {}", e)))
    }

    fn sign_enveloped(&self, _xml: &str, _reference_id: &str) -> AuthResult<String> {
        Err(AuthError::Unsupported(
            "enveloped signing needs an XML-DSig signer; use the redirect binding".to_string(),
        ))
    }
}

/// Check an enveloped signature that must cover the element `element_id`.
pub(crate) fn verify_enveloped(
    engine: &dyn TrustEngine,
    anchor: &TrustAnchor,
    document: &str,
    element_id: &str,
    signature: &XmlSignature,
) -> AuthResult<()> {
    let expected = format!("#{}", element_id);
    if signature.reference_uri.as_deref() != Some(expected.as_str()) {
        return Err(AuthError::Signature(format!(
            "signature references {:?} instead of {}",
            signature.reference_uri, expected
        )));
    }

    if let Some(method) = &signature.signature_method {
        if method == algorithms::RSA_SHA1 {
            return Err(AuthError::Signature(
                "SHA-1 signatures are not accepted".to_string(),
            ));
        }
    }

    let object = SignedObject::Enveloped {
        document,
        reference_id: element_id,
        signature,
    };
    if engine.verify(&object, anchor)? {
        Ok(())
    } else {
        Err(AuthError::Signature(format!(
            "signature on {} is not trusted",
            element_id
        )))
    }
}

/// Check a redirect binding signature.
pub(crate) fn verify_detached(
    engine: &dyn TrustEngine,
    anchor: &TrustAnchor,
    signed_content: &str,
    algorithm: &str,
    signature_b64: &str,
) -> AuthResult<()> {
    let signature = STANDARD
        .decode(signature_b64.trim())
        .map_err(|e| AuthError::Signature(format!("signature is not base64: {}", e)))?;

    let object = SignedObject::Detached {
        signed_content,
        algorithm,
        signature: &signature,
    };
    if engine.verify(&object, anchor)? {
        Ok(())
    } else {
        Err(AuthError::Signature(
            "redirect binding signature is not trusted".to_string(),
        ))
    }
}
