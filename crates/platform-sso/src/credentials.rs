//! Credentials extracted from provider callbacks
//!
//! A [`Credentials`] value is the evidence found on one inbound request. It is
//! produced by extraction, consumed once by validation and never stored.

use crate::saml::model::{NameId, SamlAttribute};
use crate::saml::SamlInbound;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Evidence of identity, per protocol.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// OIDC authorization response
    Oidc(OidcCredentials),

    /// SAML2 `Response` to an AuthnRequest (or unsolicited)
    Saml2(Box<SamlInbound>),

    /// CAS service ticket
    Cas(CasCredentials),

    /// Logout notification from the provider
    Logout(LogoutCredentials),
}

impl Credentials {
    /// Whether these credentials announce a logout.
    pub fn is_logout(&self) -> bool {
        matches!(self, Credentials::Logout(_))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::Oidc(_) => "oidc",
            Credentials::Saml2(_) => "saml2",
            Credentials::Cas(_) => "cas",
            Credentials::Logout(_) => "logout",
        }
    }
}

/// Logout notification, as found on the request.
#[derive(Debug, Clone)]
pub enum LogoutCredentials {
    /// Session key carried in clear (OIDC front-channel `sid`, CAS SLO)
    SessionKey(SessionKeyCredentials),

    /// OIDC back-channel `logout_token`, still to be validated
    OidcLogoutToken(String),

    /// SAML `LogoutRequest` or `LogoutResponse`, still to be validated
    Saml(Box<SamlInbound>),
}

/// OIDC authorization response parameters.
///
/// Any subset may be present depending on the response type.
#[derive(Clone, Default)]
pub struct OidcCredentials {
    /// Authorization code
    pub code: Option<String>,

    /// Returned CSRF state
    pub state: Option<String>,

    /// ID token (implicit / hybrid responses, or after exchange)
    pub id_token: Option<String>,

    /// Access token
    pub access_token: Option<String>,

    /// Refresh token
    pub refresh_token: Option<String>,
}

impl fmt::Debug for OidcCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcCredentials")
            .field("code", &self.code.as_ref().map(|_| "<redacted>"))
            .field("state", &self.state)
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// CAS service ticket and the service it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasCredentials {
    /// Service ticket (`ST-...`)
    pub ticket: String,

    /// Service URL the ticket is bound to
    pub service: String,
}

/// How a logout notification reached the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutType {
    /// Through the user's browser; the current session is the target
    FrontChannel,
    /// Server to server; the target session must be looked up
    BackChannel,
}

/// Session identifier announced by a logout notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyCredentials {
    /// Provider session key (OIDC `sid`, SAML `SessionIndex` or NameID, CAS ticket)
    pub session_key: String,

    /// Front- or back-channel
    pub logout_type: LogoutType,

    /// Issuer of the notification, when known
    pub issuer: Option<String>,
}

impl SessionKeyCredentials {
    /// Create session key credentials.
    pub fn new(session_key: impl Into<String>, logout_type: LogoutType) -> Self {
        Self {
            session_key: session_key.into(),
            logout_type,
            issuer: None,
        }
    }

    /// Set the issuer.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }
}

/// Normalized content of a validated SAML2 assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saml2Credentials {
    /// Subject name identifier
    pub name_id: NameId,

    /// Asserting party entity ID
    pub issuer: String,

    /// Attribute statements, flattened
    pub attributes: Vec<SamlAttribute>,

    /// `Conditions/@NotBefore`
    pub not_before: Option<DateTime<Utc>>,

    /// `Conditions/@NotOnOrAfter`
    pub not_on_or_after: Option<DateTime<Utc>>,

    /// `AuthnStatement/@SessionIndex`, needed for logout
    pub session_index: Option<String>,

    /// `AuthnStatement/@SessionNotOnOrAfter`
    pub session_not_on_or_after: Option<DateTime<Utc>>,

    /// Authentication context class references
    pub authn_context_class_refs: Vec<String>,

    /// Assertion ID
    pub message_id: String,

    /// `AuthnStatement/@AuthnInstant`
    pub authn_instant: Option<DateTime<Utc>>,
}

impl Saml2Credentials {
    /// First value of the named attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name || a.friendly_name.as_deref() == Some(name))
            .and_then(|a| a.values.first())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oidc_credentials_debug_redacts_secrets() {
        let credentials = OidcCredentials {
            code: Some("secret-code".to_string()),
            state: Some("s1".to_string()),
            ..Default::default()
        };

        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("secret-code"));
        assert!(debug.contains("s1"));
    }

    #[test]
    fn test_credentials_kind() {
        let logout = Credentials::Logout(LogoutCredentials::SessionKey(
            SessionKeyCredentials::new("sid-1", LogoutType::FrontChannel),
        ));
        assert!(logout.is_logout());
        assert_eq!(logout.kind(), "logout");

        let cas = Credentials::Cas(CasCredentials {
            ticket: "ST-1".to_string(),
            service: "https://app.example.com/".to_string(),
        });
        assert!(!cas.is_logout());
    }

    #[test]
    fn test_saml_attribute_lookup() {
        let credentials = Saml2Credentials {
            name_id: NameId::new("jdoe"),
            issuer: "https://idp.example.com".to_string(),
            attributes: vec![SamlAttribute {
                name: "urn:oid:0.9.2342.19200300.100.1.3".to_string(),
                friendly_name: Some("mail".to_string()),
                name_format: None,
                values: vec!["jdoe@example.com".to_string()],
            }],
            not_before: None,
            not_on_or_after: None,
            session_index: None,
            session_not_on_or_after: None,
            authn_context_class_refs: vec![],
            message_id: "_a1".to_string(),
            authn_instant: None,
        };

        assert_eq!(credentials.attribute("mail"), Some("jdoe@example.com"));
        assert_eq!(
            credentials.attribute("urn:oid:0.9.2342.19200300.100.1.3"),
            Some("jdoe@example.com")
        );
        assert!(credentials.attribute("cn").is_none());
    }
}
