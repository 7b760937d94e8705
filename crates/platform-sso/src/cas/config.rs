//! CAS client configuration.

use crate::config::HttpClientConfig;
use crate::error::{AuthError, AuthResult};
use serde::{Deserialize, Serialize};

/// CAS protocol version used for ticket validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CasProtocol {
    /// `/serviceValidate`
    Cas20,
    /// `/p3/serviceValidate`, attributes released
    #[default]
    Cas30,
}

/// CAS client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasClientConfig {
    /// CAS login page
    pub login_url: String,

    /// CAS server base URL (validation and logout endpoints hang off it)
    pub prefix_url: String,

    /// Our service URL, where CAS returns the ticket
    pub callback_url: String,

    /// Protocol version
    #[serde(default)]
    pub protocol: CasProtocol,

    /// Force re-authentication at CAS
    #[serde(default)]
    pub renew: bool,

    /// Ask CAS not to prompt; the callback may come back without a ticket
    #[serde(default)]
    pub gateway: bool,

    /// Where CAS sends the browser after logout
    #[serde(default)]
    pub post_logout_redirect_url: Option<String>,

    /// Validation endpoint timeouts
    #[serde(default)]
    pub http: HttpClientConfig,
}

impl CasClientConfig {
    /// Create a configuration with defaults.
    pub fn new(
        login_url: impl Into<String>,
        prefix_url: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            login_url: login_url.into(),
            prefix_url: prefix_url.into(),
            callback_url: callback_url.into(),
            protocol: CasProtocol::Cas30,
            renew: false,
            gateway: false,
            post_logout_redirect_url: None,
            http: HttpClientConfig::default(),
        }
    }

    fn prefix(&self) -> &str {
        self.prefix_url.trim_end_matches('/')
    }

    /// Ticket validation endpoint.
    pub fn validation_url(&self) -> String {
        match self.protocol {
            CasProtocol::Cas20 => format!("{}/serviceValidate", self.prefix()),
            CasProtocol::Cas30 => format!("{}/p3/serviceValidate", self.prefix()),
        }
    }

    /// Logout endpoint.
    pub fn logout_url(&self) -> String {
        format!("{}/logout", self.prefix())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> AuthResult<()> {
        for (name, value) in [
            ("login_url", &self.login_url),
            ("prefix_url", &self.prefix_url),
            ("callback_url", &self.callback_url),
        ] {
            url::Url::parse(value).map_err(|e| {
                AuthError::Configuration(format!("invalid {} {}: {}", name, value, e))
            })?;
        }

        if self.renew && self.gateway {
            return Err(AuthError::Configuration(
                "renew and gateway cannot both be set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let mut config = CasClientConfig::new(
            "https://cas.example.com/cas/login",
            "https://cas.example.com/cas/",
            "https://app.example.com/callback",
        );
        assert_eq!(
            config.validation_url(),
            "https://cas.example.com/cas/p3/serviceValidate"
        );
        assert_eq!(config.logout_url(), "https://cas.example.com/cas/logout");

        config.protocol = CasProtocol::Cas20;
        assert_eq!(
            config.validation_url(),
            "https://cas.example.com/cas/serviceValidate"
        );
    }

    #[test]
    fn test_validation() {
        let mut config = CasClientConfig::new(
            "https://cas.example.com/cas/login",
            "https://cas.example.com/cas",
            "https://app.example.com/callback",
        );
        assert!(config.validate().is_ok());

        config.renew = true;
        config.gateway = true;
        assert!(config.validate().is_err());

        let broken = CasClientConfig::new("login", "https://cas.example.com", "https://app");
        assert!(broken.validate().is_err());
    }
}
