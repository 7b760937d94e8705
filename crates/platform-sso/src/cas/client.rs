//! CAS client.

use crate::cas::config::CasClientConfig;
use crate::cas::response::{parse_logout_request, parse_service_response, CasAssertion};
use crate::context::{append_query, HttpMethod, RedirectInstruction, RequestContext};
use crate::credentials::{
    CasCredentials, Credentials, LogoutCredentials, LogoutType, SessionKeyCredentials,
};
use crate::error::{AuthError, AuthResult};
use crate::pipeline::FlowServices;
use crate::profile::{CasMaterial, ProtocolMaterial, UserProfile};
use crate::saml::binding::inflate_redirect;
use chrono::{Duration, Utc};
use std::fmt;
use tracing::instrument;

/// How long a validated ticket is remembered. CAS tickets are single use and
/// short lived; this only has to outlast the server's own ticket expiry.
const TICKET_REPLAY_TTL_SECS: i64 = 300;

/// Parameter carrying CAS single logout requests.
const LOGOUT_REQUEST_PARAM: &str = "logoutRequest";

/// CAS service ticket client.
pub struct CasClient {
    config: CasClientConfig,
    http: reqwest::Client,
}

impl fmt::Debug for CasClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CasClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CasClient {
    /// Build a client.
    pub fn new(config: CasClientConfig) -> AuthResult<Self> {
        config.validate()?;
        let http = config.http.build_client()?;

        tracing::info!(
            login_url = %config.login_url,
            protocol = ?config.protocol,
            "CAS client initialized"
        );

        Ok(Self { config, http })
    }

    /// Client configuration.
    pub fn config(&self) -> &CasClientConfig {
        &self.config
    }

    /// Redirect to the CAS login page.
    pub fn build_redirect(&self) -> RedirectInstruction {
        let mut params: Vec<(&str, &str)> = vec![("service", self.config.callback_url.as_str())];
        if self.config.renew {
            params.push(("renew", "true"));
        }
        if self.config.gateway {
            params.push(("gateway", "true"));
        }
        RedirectInstruction::Location(append_query(&self.config.login_url, &params))
    }

    /// Classify the request and pull out its credentials.
    ///
    /// Single logout requests arrive as a `logoutRequest` form field from the
    /// CAS server (back-channel) or as a deflated query parameter through the
    /// browser (front-channel).
    pub fn extract(&self, ctx: &RequestContext) -> AuthResult<Option<Credentials>> {
        if ctx.method == HttpMethod::Post {
            if let Some(xml) = ctx.form_param(LOGOUT_REQUEST_PARAM) {
                let ticket = parse_logout_request(xml)?;
                return Ok(Some(logout_credentials(ticket, LogoutType::BackChannel)));
            }
        }

        if let Some(encoded) = ctx.query_param(LOGOUT_REQUEST_PARAM) {
            let xml = inflate_redirect(encoded)?;
            let ticket = parse_logout_request(&xml)?;
            return Ok(Some(logout_credentials(ticket, LogoutType::FrontChannel)));
        }

        Ok(ctx.parameter("ticket").filter(|t| !t.is_empty()).map(|ticket| {
            Credentials::Cas(CasCredentials {
                ticket: ticket.to_string(),
                service: self.config.callback_url.clone(),
            })
        }))
    }

    /// Call the CAS validation endpoint.
    #[instrument(skip(self, ticket), fields(service = %service))]
    pub async fn validate_ticket(&self, ticket: &str, service: &str) -> AuthResult<CasAssertion> {
        let response = self
            .http
            .get(self.config.validation_url())
            .query(&[("ticket", ticket), ("service", service)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "CAS validation endpoint failed");
            return Err(AuthError::Communication(format!(
                "CAS validation endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response.text().await?;
        let assertion = parse_service_response(&body).inspect_err(|e| {
            tracing::warn!(error = %e, "CAS ticket rejected");
        })?;

        tracing::debug!(user = %assertion.user, "CAS ticket validated");
        Ok(assertion)
    }

    /// Validate a service ticket and build the profile.
    pub async fn validate(
        &self,
        credentials: CasCredentials,
        flow: &FlowServices<'_>,
    ) -> AuthResult<UserProfile> {
        let assertion = self
            .validate_ticket(&credentials.ticket, &credentials.service)
            .await?;

        let replay_key = format!("cas:{}", credentials.ticket);
        let replay_until = Utc::now() + Duration::seconds(TICKET_REPLAY_TTL_SECS);
        if !flow.replay.check_and_insert(&replay_key, replay_until).await? {
            tracing::warn!(user = %assertion.user, "CAS ticket presented twice");
            return Err(AuthError::Replay(
                "service ticket has already been used".to_string(),
            ));
        }

        let material = CasMaterial {
            ticket: credentials.ticket,
            service: credentials.service,
        };
        let mut profile = UserProfile::new(
            assertion.user,
            flow.client_name,
            ProtocolMaterial::Cas(material),
        );
        profile.attributes = assertion.attributes;
        Ok(profile)
    }

    /// Redirect to the CAS logout endpoint.
    pub fn build_logout_redirect(&self) -> RedirectInstruction {
        let logout_url = self.config.logout_url();
        match &self.config.post_logout_redirect_url {
            Some(target) => {
                RedirectInstruction::Location(append_query(&logout_url, &[("service", target)]))
            }
            None => RedirectInstruction::Location(logout_url),
        }
    }
}

fn logout_credentials(ticket: String, logout_type: LogoutType) -> Credentials {
    Credentials::Logout(LogoutCredentials::SessionKey(SessionKeyCredentials::new(
        ticket,
        logout_type,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::binding::deflate_redirect;

    const LOGOUT_XML: &str = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="LR-1" Version="2.0" IssueInstant="2026-03-01T10:00:00Z"><saml:NameID xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">@NOT_USED@</saml:NameID><samlp:SessionIndex>ST-42</samlp:SessionIndex></samlp:LogoutRequest>"#;

    fn client(renew: bool) -> CasClient {
        let mut config = CasClientConfig::new(
            "https://cas.example.com/cas/login",
            "https://cas.example.com/cas",
            "https://app.example.com/callback",
        );
        config.renew = renew;
        config.post_logout_redirect_url = Some("https://app.example.com/".to_string());
        CasClient::new(config).unwrap()
    }

    #[test]
    fn test_login_redirect() {
        let redirect = client(true).build_redirect();
        let location = redirect.location().unwrap();

        assert!(location.starts_with("https://cas.example.com/cas/login?service="));
        assert!(location.contains("service=https%3A%2F%2Fapp.example.com%2Fcallback"));
        assert!(location.ends_with("&renew=true"));
        assert!(!location.contains("gateway"));
    }

    #[test]
    fn test_extract_ticket() {
        let ctx = RequestContext::get(
            "https://app.example.com/callback?ticket=ST-1-abc",
            "s-1",
        );
        match client(false).extract(&ctx).unwrap() {
            Some(Credentials::Cas(creds)) => {
                assert_eq!(creds.ticket, "ST-1-abc");
                assert_eq!(creds.service, "https://app.example.com/callback");
            }
            other => panic!("unexpected credentials: {:?}", other),
        }

        let ctx = RequestContext::get("https://app.example.com/callback", "s-1");
        assert!(client(false).extract(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_extract_logout_requests() {
        let ctx = RequestContext::post("https://app.example.com/callback", "")
            .with_form_param(LOGOUT_REQUEST_PARAM, LOGOUT_XML);
        match client(false).extract(&ctx).unwrap() {
            Some(Credentials::Logout(LogoutCredentials::SessionKey(creds))) => {
                assert_eq!(creds.session_key, "ST-42");
                assert_eq!(creds.logout_type, LogoutType::BackChannel);
            }
            other => panic!("unexpected credentials: {:?}", other),
        }

        let encoded = deflate_redirect(LOGOUT_XML).unwrap();
        let url = append_query(
            "https://app.example.com/callback",
            &[(LOGOUT_REQUEST_PARAM, encoded.as_str())],
        );
        let ctx = RequestContext::get(url, "s-1");
        match client(false).extract(&ctx).unwrap() {
            Some(Credentials::Logout(LogoutCredentials::SessionKey(creds))) => {
                assert_eq!(creds.session_key, "ST-42");
                assert_eq!(creds.logout_type, LogoutType::FrontChannel);
            }
            other => panic!("unexpected credentials: {:?}", other),
        }
    }

    #[test]
    fn test_logout_redirect() {
        let redirect = client(false).build_logout_redirect();
        assert_eq!(
            redirect.location(),
            Some("https://cas.example.com/cas/logout?service=https%3A%2F%2Fapp.example.com%2F")
        );
    }
}
