//! Normalized user profile
//!
//! Every protocol client ends a successful login by producing a
//! [`UserProfile`]: a stable identifier, an attribute map and the
//! protocol material (tokens, session index, ticket) needed later for
//! refresh and logout.

use crate::saml::model::NameId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Protocol that authenticated the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// OpenID Connect
    Oidc,
    /// SAML2 Web Browser SSO
    Saml2,
    /// CAS
    Cas,
}

impl AuthMethod {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Oidc => "oidc",
            AuthMethod::Saml2 => "saml2",
            AuthMethod::Cas => "cas",
        }
    }
}

/// Token material from an OIDC login.
#[derive(Clone, Serialize, Deserialize)]
pub struct OidcMaterial {
    /// Provider issuer
    pub issuer: String,

    /// Raw ID token (used as `id_token_hint` on logout)
    pub id_token: Option<String>,

    /// Access token
    pub access_token: Option<String>,

    /// Refresh token
    pub refresh_token: Option<String>,

    /// Access token expiry
    pub expires_at: Option<DateTime<Utc>>,

    /// Provider session ID (`sid` claim)
    pub sid: Option<String>,
}

impl fmt::Debug for OidcMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcMaterial")
            .field("issuer", &self.issuer)
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("sid", &self.sid)
            .finish()
    }
}

/// Assertion material from a SAML2 login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saml2Material {
    /// IdP entity ID
    pub issuer: String,

    /// Subject name identifier, echoed in LogoutRequest
    pub name_id: NameId,

    /// IdP session index
    pub session_index: Option<String>,

    /// Assertion ID
    pub assertion_id: String,

    /// Authentication context class references
    pub authn_context_class_refs: Vec<String>,

    /// End of the assertion validity window
    pub not_on_or_after: Option<DateTime<Utc>>,
}

/// Ticket material from a CAS login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasMaterial {
    /// Validated service ticket; CAS single logout refers to it
    pub ticket: String,

    /// Service URL
    pub service: String,
}

/// Protocol specific material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolMaterial {
    /// OIDC tokens
    Oidc(OidcMaterial),
    /// SAML2 assertion data
    Saml2(Saml2Material),
    /// CAS ticket
    Cas(CasMaterial),
}

/// Authenticated user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Stable identifier (OIDC `sub`, SAML NameID, CAS user)
    pub id: String,

    /// Client that produced this profile
    pub client_name: String,

    /// Protocol used
    pub auth_method: AuthMethod,

    /// Attributes released by the provider
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// Material for refresh and logout
    pub material: ProtocolMaterial,

    /// When the login completed
    pub authenticated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Create a profile.
    pub fn new(
        id: impl Into<String>,
        client_name: impl Into<String>,
        material: ProtocolMaterial,
    ) -> Self {
        let auth_method = match &material {
            ProtocolMaterial::Oidc(_) => AuthMethod::Oidc,
            ProtocolMaterial::Saml2(_) => AuthMethod::Saml2,
            ProtocolMaterial::Cas(_) => AuthMethod::Cas,
        };

        Self {
            id: id.into(),
            client_name: client_name.into(),
            auth_method,
            attributes: HashMap::new(),
            material,
            authenticated_at: Utc::now(),
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    /// Attribute as a string. Multi-valued attributes yield their first value.
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name)? {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Array(values) => values.first().and_then(|v| v.as_str()),
            _ => None,
        }
    }

    /// Email address, from `email` or `mail`.
    pub fn email(&self) -> Option<&str> {
        self.attribute_str("email")
            .or_else(|| self.attribute_str("mail"))
    }

    /// Display name, from `name`, `displayName` or `cn`.
    pub fn display_name(&self) -> Option<&str> {
        ["name", "displayName", "cn"]
            .iter()
            .find_map(|key| self.attribute_str(key))
    }

    /// Check if the OIDC access token has expired.
    ///
    /// Profiles without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        match &self.material {
            ProtocolMaterial::Oidc(oidc) => oidc.expires_at.is_some_and(|exp| exp <= Utc::now()),
            _ => false,
        }
    }

    /// Provider session key used to find this login from a logout
    /// notification.
    pub fn logout_key(&self) -> Option<&str> {
        self.logout_keys().into_iter().next()
    }

    /// All keys a logout notification may refer to.
    ///
    /// Logout notifications may name the login by provider session
    /// (`sid`, `SessionIndex`) or only by subject, so both are tracked.
    pub fn logout_keys(&self) -> Vec<&str> {
        match &self.material {
            ProtocolMaterial::Oidc(oidc) => oidc
                .sid
                .as_deref()
                .into_iter()
                .chain(std::iter::once(self.id.as_str()))
                .collect(),
            ProtocolMaterial::Saml2(saml) => saml
                .session_index
                .as_deref()
                .into_iter()
                .chain(std::iter::once(saml.name_id.value.as_str()))
                .collect(),
            ProtocolMaterial::Cas(cas) => vec![cas.ticket.as_str()],
        }
    }

    /// OIDC material, if this is an OIDC profile.
    pub fn oidc(&self) -> Option<&OidcMaterial> {
        match &self.material {
            ProtocolMaterial::Oidc(oidc) => Some(oidc),
            _ => None,
        }
    }

    /// SAML2 material, if this is a SAML2 profile.
    pub fn saml2(&self) -> Option<&Saml2Material> {
        match &self.material {
            ProtocolMaterial::Saml2(saml) => Some(saml),
            _ => None,
        }
    }
}
