//! SAML2 single logout validation.
//!
//! One endpoint receives two message shapes: `LogoutRequest` from an
//! IdP-initiated logout and `LogoutResponse` answering our own request.

use crate::credentials::{LogoutType, SessionKeyCredentials};
use crate::error::{AuthError, AuthResult};
use crate::saml::binding::{SamlBinding, SamlInbound};
use crate::saml::config::{IdpMetadata, Saml2ClientConfig};
use crate::saml::model::{LogoutRequest, LogoutResponse, SamlMessage};
use crate::saml::parser::parse_name_id;
use crate::saml::trust::{verify_detached, verify_enveloped, Decrypter, TrustEngine};
use chrono::{DateTime, Duration, Utc};
use platform_replay::ReplayCache;
use std::sync::Arc;

/// Validated IdP-initiated logout request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedLogoutRequest {
    /// Request `ID`, echoed as `InResponseTo`
    pub request_id: String,

    /// Session to terminate
    pub session: SessionKeyCredentials,

    /// `RelayState` to return with the response
    pub relay_state: Option<String>,

    /// Binding the request arrived on
    pub binding: SamlBinding,
}

/// Outcome of a validated LogoutResponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutResponseStatus {
    /// Every session participant logged out
    Complete,
    /// Responder/PartialLogout, accepted by configuration
    Partial,
}

/// Validator for single logout messages.
#[derive(Clone)]
pub struct Saml2LogoutValidator {
    config: Saml2ClientConfig,
    trust: Arc<dyn TrustEngine>,
    decrypter: Option<Arc<dyn Decrypter>>,
}

impl std::fmt::Debug for Saml2LogoutValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saml2LogoutValidator")
            .field("sp_entity_id", &self.config.sp_entity_id)
            .field("accept_partial_logout", &self.config.accept_partial_logout)
            .finish()
    }
}

impl Saml2LogoutValidator {
    /// Create a validator.
    pub fn new(
        config: Saml2ClientConfig,
        trust: Arc<dyn TrustEngine>,
        decrypter: Option<Arc<dyn Decrypter>>,
    ) -> Self {
        Self {
            config,
            trust,
            decrypter,
        }
    }

    fn skew(&self) -> Duration {
        Duration::seconds(self.config.clock_skew_secs)
    }

    /// Validate an IdP-initiated LogoutRequest.
    pub async fn validate_request(
        &self,
        inbound: &SamlInbound,
        idp: &IdpMetadata,
        replay: &dyn ReplayCache,
        now: DateTime<Utc>,
    ) -> AuthResult<ValidatedLogoutRequest> {
        let SamlMessage::LogoutRequest(request) = &inbound.message else {
            return Err(AuthError::InvalidMessage(
                "expected a SAML LogoutRequest".to_string(),
            ));
        };

        let result = self.check_request(inbound, request, idp, replay, now).await;
        if let Err(e) = &result {
            if e.is_security_rejection() {
                tracing::warn!(request_id = %request.id, error = %e, "SAML logout request rejected");
            }
        }
        result
    }

    async fn check_request(
        &self,
        inbound: &SamlInbound,
        request: &LogoutRequest,
        idp: &IdpMetadata,
        replay: &dyn ReplayCache,
        now: DateTime<Utc>,
    ) -> AuthResult<ValidatedLogoutRequest> {
        let signed = self.verify_signature(inbound, &request.id, request.signature.as_ref(), idp)?;
        if !signed && self.config.want_logout_requests_signed && !self.config.allow_unsigned {
            return Err(AuthError::Signature(format!(
                "logout request {} is not signed",
                request.id
            )));
        }

        self.check_issuer(request.issuer.as_deref(), idp)?;
        self.check_destination(request.destination.as_deref())?;
        self.check_issue_instant(request.issue_instant, now)?;

        if let Some(not_on_or_after) = request.not_on_or_after {
            if now - self.skew() >= not_on_or_after {
                return Err(AuthError::ExpiredOrNotYetValid(format!(
                    "logout request expired at {}",
                    not_on_or_after
                )));
            }
        }

        let session_key = match request.session_indexes.first() {
            Some(index) => index.clone(),
            None => match (&request.name_id, &request.encrypted_id) {
                (Some(name_id), _) => name_id.value.clone(),
                (None, Some(encrypted)) => {
                    let decrypter = self.decrypter.as_deref().ok_or_else(|| {
                        AuthError::Configuration(
                            "encrypted NameID received but no decrypter is configured"
                                .to_string(),
                        )
                    })?;
                    parse_name_id(&decrypter.decrypt(encrypted)?)?.value
                }
                (None, None) => {
                    return Err(AuthError::InvalidMessage(
                        "logout request names no session".to_string(),
                    ))
                }
            },
        };

        let replay_until = request
            .not_on_or_after
            .unwrap_or_else(|| now + Duration::seconds(self.config.max_response_age_secs))
            + self.skew();
        let replay_key = format!("saml2-logout:{}:{}", idp.entity_id, request.id);
        if !replay.check_and_insert(&replay_key, replay_until).await? {
            return Err(AuthError::Replay(format!(
                "logout request {} was already processed",
                request.id
            )));
        }

        let logout_type = match inbound.binding {
            SamlBinding::Soap => LogoutType::BackChannel,
            SamlBinding::Redirect | SamlBinding::Post => LogoutType::FrontChannel,
        };

        Ok(ValidatedLogoutRequest {
            request_id: request.id.clone(),
            session: SessionKeyCredentials::new(session_key, logout_type)
                .with_issuer(idp.entity_id.clone()),
            relay_state: inbound.relay_state.clone(),
            binding: inbound.binding,
        })
    }

    /// Validate the LogoutResponse answering our LogoutRequest.
    ///
    /// `expected_request_id` is the ID of the request we sent, when it is
    /// still in the session. Without one the response is unsolicited and
    /// rejected.
    pub fn validate_response(
        &self,
        inbound: &SamlInbound,
        idp: &IdpMetadata,
        expected_request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<LogoutResponseStatus> {
        let SamlMessage::LogoutResponse(response) = &inbound.message else {
            return Err(AuthError::InvalidMessage(
                "expected a SAML LogoutResponse".to_string(),
            ));
        };

        let result = self.check_response(inbound, response, idp, expected_request_id, now);
        if let Err(e) = &result {
            if e.is_security_rejection() {
                tracing::warn!(response_id = %response.id, error = %e, "SAML logout response rejected");
            }
        }
        result
    }

    fn check_response(
        &self,
        inbound: &SamlInbound,
        response: &LogoutResponse,
        idp: &IdpMetadata,
        expected_request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<LogoutResponseStatus> {
        let signed =
            self.verify_signature(inbound, &response.id, response.signature.as_ref(), idp)?;
        if !signed && !self.config.allow_unsigned {
            return Err(AuthError::Signature(format!(
                "logout response {} is not signed",
                response.id
            )));
        }

        self.check_issue_instant(response.issue_instant, now)?;
        self.check_issuer(response.issuer.as_deref(), idp)?;
        self.check_destination(response.destination.as_deref())?;

        let expected = expected_request_id.ok_or_else(|| {
            AuthError::StateMismatch(format!(
                "logout response {} arrived with no logout request pending",
                response.id
            ))
        })?;
        if response.in_response_to.as_deref() != Some(expected) {
            return Err(AuthError::StateMismatch(format!(
                "logout response answers {:?} instead of {}",
                response.in_response_to, expected
            )));
        }

        if response.status.is_success() {
            return Ok(LogoutResponseStatus::Complete);
        }
        if response.status.is_partial_logout() && self.config.accept_partial_logout {
            tracing::info!(response_id = %response.id, "Partial logout accepted");
            return Ok(LogoutResponseStatus::Partial);
        }

        Err(AuthError::protocol(
            response.status.code.clone(),
            response
                .status
                .sub_code
                .clone()
                .or_else(|| response.status.message.clone()),
        ))
    }

    /// Verify whichever signature the message carries. Returns whether one was present.
    fn verify_signature(
        &self,
        inbound: &SamlInbound,
        message_id: &str,
        signature: Option<&crate::saml::model::XmlSignature>,
        idp: &IdpMetadata,
    ) -> AuthResult<bool> {
        if let Some(signature) = signature {
            verify_enveloped(
                self.trust.as_ref(),
                &idp.trust_anchor,
                &inbound.xml,
                message_id,
                signature,
            )?;
            return Ok(true);
        }

        if let Some(detached) = &inbound.redirect_signature {
            verify_detached(
                self.trust.as_ref(),
                &idp.trust_anchor,
                &detached.signed_content,
                &detached.sig_alg,
                &detached.signature,
            )?;
            return Ok(true);
        }

        Ok(false)
    }

    fn check_issuer(&self, issuer: Option<&str>, idp: &IdpMetadata) -> AuthResult<()> {
        match issuer {
            Some(issuer) if issuer == idp.entity_id => Ok(()),
            other => Err(AuthError::InvalidClaim(format!(
                "logout issuer {:?} does not match {}",
                other, idp.entity_id
            ))),
        }
    }

    fn check_destination(&self, destination: Option<&str>) -> AuthResult<()> {
        match destination {
            Some(destination) if destination != self.config.slo_url() => {
                Err(AuthError::InvalidClaim(format!(
                    "destination {} is not {}",
                    destination,
                    self.config.slo_url()
                )))
            }
            None if self.config.destination_mandatory => Err(AuthError::InvalidClaim(
                "logout message names no Destination".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn check_issue_instant(&self, issued: DateTime<Utc>, now: DateTime<Utc>) -> AuthResult<()> {
        if issued > now + self.skew() {
            return Err(AuthError::ExpiredOrNotYetValid(format!(
                "logout message issued in the future ({})",
                issued
            )));
        }
        if issued + Duration::seconds(self.config.max_response_age_secs) < now - self.skew() {
            return Err(AuthError::ExpiredOrNotYetValid(format!(
                "logout message issued at {} is too old",
                issued
            )));
        }
        Ok(())
    }
}
