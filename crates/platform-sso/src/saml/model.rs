//! SAML2 protocol message model.
//!
//! Only what the service provider side inspects is modelled. Every
//! signable element keeps its original source text so signatures can be
//! checked against the exact bytes the IdP signed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level status code for success.
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
/// Top-level status code for an IdP-side failure.
pub const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";
/// Second-level status for single logout that reached only some SPs.
pub const STATUS_PARTIAL_LOGOUT: &str = "urn:oasis:names:tc:SAML:2.0:status:PartialLogout";
/// Bearer subject confirmation method.
pub const CONFIRMATION_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// Subject name identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameId {
    /// Identifier value
    pub value: String,

    /// `Format` attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// `NameQualifier` attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_qualifier: Option<String>,

    /// `SPNameQualifier` attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp_name_qualifier: Option<String>,
}

impl NameId {
    /// Name identifier without qualifiers.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            format: None,
            name_qualifier: None,
            sp_name_qualifier: None,
        }
    }
}

/// One SAML attribute with all its values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SamlAttribute {
    /// `Name`
    pub name: String,

    /// `FriendlyName`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,

    /// `NameFormat`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_format: Option<String>,

    /// `AttributeValue` texts
    pub values: Vec<String>,
}

/// Encrypted element, kept as source text for the decrypter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedElement {
    /// Source of the `EncryptedAssertion` / `EncryptedID` / `EncryptedAttribute`
    pub xml: String,
}

/// Enveloped XML signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlSignature {
    /// `Reference/@URI`
    pub reference_uri: Option<String>,

    /// `SignatureMethod/@Algorithm`
    pub signature_method: Option<String>,

    /// `SignatureValue`, base64
    pub signature_value: String,

    /// `X509Certificate` values from `KeyInfo`
    pub certificates: Vec<String>,
}

/// Protocol status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Top-level status code
    pub code: String,

    /// Second-level status code
    pub sub_code: Option<String>,

    /// `StatusMessage`
    pub message: Option<String>,
}

impl Status {
    /// Success status.
    pub fn success() -> Self {
        Self {
            code: STATUS_SUCCESS.to_string(),
            sub_code: None,
            message: None,
        }
    }

    /// Whether the top-level code is Success.
    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }

    /// Whether this is Responder / PartialLogout.
    pub fn is_partial_logout(&self) -> bool {
        self.code == STATUS_RESPONDER && self.sub_code.as_deref() == Some(STATUS_PARTIAL_LOGOUT)
    }
}

/// `SubjectConfirmationData`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectConfirmationData {
    /// `Recipient`
    pub recipient: Option<String>,
    /// `NotBefore`
    pub not_before: Option<DateTime<Utc>>,
    /// `NotOnOrAfter`
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// `InResponseTo`
    pub in_response_to: Option<String>,
    /// `Address`
    pub address: Option<String>,
}

/// `SubjectConfirmation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectConfirmation {
    /// `Method`
    pub method: String,
    /// Confirmation data
    pub data: Option<SubjectConfirmationData>,
}

/// `Subject`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    /// Clear name identifier
    pub name_id: Option<NameId>,
    /// Encrypted name identifier
    pub encrypted_id: Option<EncryptedElement>,
    /// Subject confirmations
    pub confirmations: Vec<SubjectConfirmation>,
}

/// `Conditions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    /// `NotBefore`
    pub not_before: Option<DateTime<Utc>>,
    /// `NotOnOrAfter`
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// One audience list per `AudienceRestriction`
    pub audience_restrictions: Vec<Vec<String>>,
    /// `OneTimeUse` present
    pub one_time_use: bool,
}

/// `AuthnStatement`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthnStatement {
    /// `AuthnInstant`
    pub authn_instant: Option<DateTime<Utc>>,
    /// `SessionIndex`
    pub session_index: Option<String>,
    /// `SessionNotOnOrAfter`
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    /// `AuthnContextClassRef` values
    pub class_refs: Vec<String>,
}

/// `Assertion`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// `ID`
    pub id: String,
    /// `Issuer`
    pub issuer: Option<String>,
    /// `IssueInstant`
    pub issue_instant: Option<DateTime<Utc>>,
    /// Enveloped signature
    pub signature: Option<XmlSignature>,
    /// `Subject`
    pub subject: Option<Subject>,
    /// `Conditions`
    pub conditions: Option<Conditions>,
    /// `AuthnStatement`s
    pub authn_statements: Vec<AuthnStatement>,
    /// Clear attributes
    pub attributes: Vec<SamlAttribute>,
    /// Encrypted attributes
    pub encrypted_attributes: Vec<EncryptedElement>,
    /// Complete document the assertion was read from: the enclosing
    /// message, or the decrypted plaintext. Signatures are checked against
    /// this text by reference ID.
    pub document: String,
}

/// `Response`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlResponse {
    /// `ID`
    pub id: String,
    /// `InResponseTo`
    pub in_response_to: Option<String>,
    /// `IssueInstant`
    pub issue_instant: DateTime<Utc>,
    /// `Destination`
    pub destination: Option<String>,
    /// `Issuer`
    pub issuer: Option<String>,
    /// `Status`
    pub status: Status,
    /// Enveloped signature on the response
    pub signature: Option<XmlSignature>,
    /// Clear assertions
    pub assertions: Vec<Assertion>,
    /// Encrypted assertions
    pub encrypted_assertions: Vec<EncryptedElement>,
}

/// `LogoutRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    /// `ID`
    pub id: String,
    /// `IssueInstant`
    pub issue_instant: DateTime<Utc>,
    /// `Destination`
    pub destination: Option<String>,
    /// `Issuer`
    pub issuer: Option<String>,
    /// `NotOnOrAfter`
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// `Reason`
    pub reason: Option<String>,
    /// Clear name identifier
    pub name_id: Option<NameId>,
    /// Encrypted name identifier
    pub encrypted_id: Option<EncryptedElement>,
    /// `SessionIndex` values
    pub session_indexes: Vec<String>,
    /// Enveloped signature
    pub signature: Option<XmlSignature>,
}

/// `LogoutResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponse {
    /// `ID`
    pub id: String,
    /// `InResponseTo`
    pub in_response_to: Option<String>,
    /// `IssueInstant`
    pub issue_instant: DateTime<Utc>,
    /// `Destination`
    pub destination: Option<String>,
    /// `Issuer`
    pub issuer: Option<String>,
    /// `Status`
    pub status: Status,
    /// Enveloped signature
    pub signature: Option<XmlSignature>,
}

/// Any inbound SAML protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamlMessage {
    /// Authentication response
    Response(SamlResponse),
    /// IdP-initiated logout
    LogoutRequest(LogoutRequest),
    /// Answer to our LogoutRequest
    LogoutResponse(LogoutResponse),
}

impl SamlMessage {
    /// Message `ID`.
    pub fn id(&self) -> &str {
        match self {
            SamlMessage::Response(m) => &m.id,
            SamlMessage::LogoutRequest(m) => &m.id,
            SamlMessage::LogoutResponse(m) => &m.id,
        }
    }

    /// Message `Issuer`.
    pub fn issuer(&self) -> Option<&str> {
        match self {
            SamlMessage::Response(m) => m.issuer.as_deref(),
            SamlMessage::LogoutRequest(m) => m.issuer.as_deref(),
            SamlMessage::LogoutResponse(m) => m.issuer.as_deref(),
        }
    }

    /// Enveloped signature on the message itself.
    pub fn signature(&self) -> Option<&XmlSignature> {
        match self {
            SamlMessage::Response(m) => m.signature.as_ref(),
            SamlMessage::LogoutRequest(m) => m.signature.as_ref(),
            SamlMessage::LogoutResponse(m) => m.signature.as_ref(),
        }
    }

    /// Whether this is a logout message.
    pub fn is_logout(&self) -> bool {
        !matches!(self, SamlMessage::Response(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(Status::success().is_success());

        let partial = Status {
            code: STATUS_RESPONDER.to_string(),
            sub_code: Some(STATUS_PARTIAL_LOGOUT.to_string()),
            message: None,
        };
        assert!(!partial.is_success());
        assert!(partial.is_partial_logout());

        let requester = Status {
            code: "urn:oasis:names:tc:SAML:2.0:status:Requester".to_string(),
            sub_code: Some(STATUS_PARTIAL_LOGOUT.to_string()),
            message: None,
        };
        assert!(!requester.is_partial_logout());
    }
}
