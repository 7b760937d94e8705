//! SAML2 `Response` validation.
//!
//! Checks run from the cheapest to the most expensive and every one of them
//! must pass. The assertion ID enters the replay cache only after all other
//! checks succeeded, so a rejected response leaves no state behind.

use crate::credentials::Saml2Credentials;
use crate::error::{AuthError, AuthResult};
use crate::saml::binding::SamlInbound;
use crate::saml::config::{IdpMetadata, Saml2ClientConfig};
use crate::saml::model::{
    Assertion, Conditions, NameId, SamlMessage, SamlResponse, SubjectConfirmation,
    CONFIRMATION_BEARER,
};
use crate::saml::parser::{parse_assertion, parse_attribute, parse_name_id};
use crate::saml::trust::{verify_detached, verify_enveloped, Decrypter, TrustEngine};
use chrono::{DateTime, Duration, Utc};
use platform_replay::ReplayCache;
use std::sync::Arc;

/// Validator for authentication responses.
#[derive(Clone)]
pub struct Saml2ResponseValidator {
    config: Saml2ClientConfig,
    trust: Arc<dyn TrustEngine>,
    decrypter: Option<Arc<dyn Decrypter>>,
}

impl std::fmt::Debug for Saml2ResponseValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saml2ResponseValidator")
            .field("sp_entity_id", &self.config.sp_entity_id)
            .field("decrypter", &self.decrypter.is_some())
            .finish()
    }
}

/// Outcome of the per-message signature check.
struct SignatureState {
    message_signed: bool,
}

impl Saml2ResponseValidator {
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

    /// Validate a response against the current time.
    pub async fn validate(
        &self,
        inbound: &SamlInbound,
        idp: &IdpMetadata,
        expected_request_id: Option<&str>,
        replay: &dyn ReplayCache,
    ) -> AuthResult<Saml2Credentials> {
        self.validate_at(inbound, idp, expected_request_id, replay, Utc::now())
            .await
    }

    /// Validate a response as of `now`.
    pub async fn validate_at(
        &self,
        inbound: &SamlInbound,
        idp: &IdpMetadata,
        expected_request_id: Option<&str>,
        replay: &dyn ReplayCache,
        now: DateTime<Utc>,
    ) -> AuthResult<Saml2Credentials> {
        let SamlMessage::Response(response) = &inbound.message else {
            return Err(AuthError::InvalidMessage(
                "expected a SAML Response".to_string(),
            ));
        };

        let result = self
            .check(inbound, response, idp, expected_request_id, replay, now)
            .await;

        match &result {
            Ok(credentials) => tracing::debug!(
                response_id = %response.id,
                assertion_id = %credentials.message_id,
                "SAML response accepted"
            ),
            Err(e) if e.is_security_rejection() => tracing::warn!(
                response_id = %response.id,
                issuer = ?response.issuer,
                error = %e,
                "SAML response rejected"
            ),
            Err(e) => tracing::debug!(response_id = %response.id, error = %e, "SAML response invalid"),
        }
        result
    }

    async fn check(
        &self,
        inbound: &SamlInbound,
        response: &SamlResponse,
        idp: &IdpMetadata,
        expected_request_id: Option<&str>,
        replay: &dyn ReplayCache,
        now: DateTime<Utc>,
    ) -> AuthResult<Saml2Credentials> {
        if !response.status.is_success() {
            return Err(AuthError::protocol(
                response.status.code.clone(),
                response.status.message.clone().or_else(|| response.status.sub_code.clone()),
            ));
        }

        if let Some(issuer) = &response.issuer {
            self.check_issuer(issuer, idp)?;
        }
        self.check_destination(response.destination.as_deref())?;
        self.check_in_response_to(response.in_response_to.as_deref(), expected_request_id)?;
        self.check_issue_instant(response.issue_instant, now)?;

        let signatures = self.verify_message_signature(inbound, response, idp)?;

        let assertion = self.single_assertion(response)?;
        let assertion_signed = match &assertion.signature {
            Some(signature) => {
                verify_enveloped(
                    self.trust.as_ref(),
                    &idp.trust_anchor,
                    &assertion.document,
                    &assertion.id,
                    signature,
                )?;
                true
            }
            None => false,
        };

        if self.config.want_assertions_signed && !assertion_signed {
            return Err(AuthError::Signature(format!(
                "assertion {} is not signed",
                assertion.id
            )));
        }
        if !signatures.message_signed && !assertion_signed && !self.config.allow_unsigned {
            return Err(AuthError::Signature(
                "neither the response nor the assertion is signed".to_string(),
            ));
        }

        let assertion_issuer = assertion.issuer.clone().ok_or_else(|| {
            AuthError::InvalidMessage(format!("assertion {} has no Issuer", assertion.id))
        })?;
        self.check_issuer(&assertion_issuer, idp)?;

        let conditions = assertion.conditions.clone().unwrap_or_default();
        self.check_conditions(&conditions, now)?;
        self.check_audience(&conditions)?;

        let subject = assertion.subject.as_ref().ok_or_else(|| {
            AuthError::InvalidMessage(format!("assertion {} has no Subject", assertion.id))
        })?;
        let confirmation_expiry =
            self.check_bearer_confirmation(&subject.confirmations, expected_request_id, now)?;

        let name_id = match (&subject.name_id, &subject.encrypted_id) {
            (Some(name_id), _) => name_id.clone(),
            (None, Some(encrypted)) => parse_name_id(&self.decrypter()?.decrypt(encrypted)?)?,
            (None, None) => {
                return Err(AuthError::InvalidMessage(format!(
                    "assertion {} has no NameID",
                    assertion.id
                )))
            }
        };

        let statement = assertion.authn_statements.first().cloned().unwrap_or_default();
        if let (Some(lifetime), Some(authn_instant)) = (
            self.config.max_authentication_lifetime_secs,
            statement.authn_instant,
        ) {
            if authn_instant + Duration::seconds(lifetime) < now - self.skew() {
                return Err(AuthError::ExpiredOrNotYetValid(format!(
                    "authentication at {} is older than {}s",
                    authn_instant, lifetime
                )));
            }
        }
        if let Some(session_end) = statement.session_not_on_or_after {
            if now - self.skew() >= session_end {
                return Err(AuthError::ExpiredOrNotYetValid(format!(
                    "IdP session ended at {}",
                    session_end
                )));
            }
        }

        let mut attributes = assertion.attributes.clone();
        for encrypted in &assertion.encrypted_attributes {
            attributes.push(parse_attribute(&self.decrypter()?.decrypt(encrypted)?)?);
        }

        let replay_until = conditions
            .not_on_or_after
            .or(confirmation_expiry)
            .unwrap_or_else(|| now + Duration::seconds(self.config.max_response_age_secs))
            + self.skew();
        let replay_key = format!("saml2:{}:{}", idp.entity_id, assertion.id);
        if !replay.check_and_insert(&replay_key, replay_until).await? {
            return Err(AuthError::Replay(format!(
                "assertion {} was already consumed",
                assertion.id
            )));
        }

        Ok(build_credentials(
            assertion,
            name_id,
            assertion_issuer,
            &conditions,
            statement,
            attributes,
        ))
    }

    fn decrypter(&self) -> AuthResult<&dyn Decrypter> {
        self.decrypter.as_deref().ok_or_else(|| {
            AuthError::Configuration("encrypted content received but no decrypter is configured".to_string())
        })
    }

    fn check_issuer(&self, issuer: &str, idp: &IdpMetadata) -> AuthResult<()> {
        if issuer != idp.entity_id {
            return Err(AuthError::InvalidClaim(format!(
                "issuer {} does not match {}",
                issuer, idp.entity_id
            )));
        }
        Ok(())
    }

    fn check_destination(&self, destination: Option<&str>) -> AuthResult<()> {
        match destination {
            Some(destination) if destination != self.config.acs_url => {
                Err(AuthError::InvalidClaim(format!(
                    "destination {} is not {}",
                    destination, self.config.acs_url
                )))
            }
            None if self.config.destination_mandatory => Err(AuthError::InvalidClaim(
                "response names no Destination".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn check_in_response_to(
        &self,
        in_response_to: Option<&str>,
        expected: Option<&str>,
    ) -> AuthResult<()> {
        match (in_response_to, expected) {
            (Some(actual), Some(expected)) if actual == expected => Ok(()),
            (Some(actual), Some(_)) => Err(AuthError::StateMismatch(format!(
                "response answers {} which is not the pending request",
                actual
            ))),
            (Some(actual), None) => Err(AuthError::StateMismatch(format!(
                "response answers {} but no request is pending",
                actual
            ))),
            (None, _) if self.config.allow_unsolicited_responses => Ok(()),
            (None, _) => Err(AuthError::StateMismatch(
                "unsolicited responses are not accepted".to_string(),
            )),
        }
    }

    fn check_issue_instant(&self, issued: DateTime<Utc>, now: DateTime<Utc>) -> AuthResult<()> {
        if issued > now + self.skew() {
            return Err(AuthError::ExpiredOrNotYetValid(format!(
                "response issued in the future ({})",
                issued
            )));
        }
        if issued + Duration::seconds(self.config.max_response_age_secs) < now - self.skew() {
            return Err(AuthError::ExpiredOrNotYetValid(format!(
                "response issued at {} is too old",
                issued
            )));
        }
        Ok(())
    }

    fn verify_message_signature(
        &self,
        inbound: &SamlInbound,
        response: &SamlResponse,
        idp: &IdpMetadata,
    ) -> AuthResult<SignatureState> {
        if let Some(signature) = &response.signature {
            verify_enveloped(
                self.trust.as_ref(),
                &idp.trust_anchor,
                &inbound.xml,
                &response.id,
                signature,
            )?;
            return Ok(SignatureState {
                message_signed: true,
            });
        }

        if let Some(detached) = &inbound.redirect_signature {
            verify_detached(
                self.trust.as_ref(),
                &idp.trust_anchor,
                &detached.signed_content,
                &detached.sig_alg,
                &detached.signature,
            )?;
            return Ok(SignatureState {
                message_signed: true,
            });
        }

        Ok(SignatureState {
            message_signed: false,
        })
    }

    fn single_assertion(&self, response: &SamlResponse) -> AuthResult<Assertion> {
        let mut assertions = response.assertions.clone();
        for encrypted in &response.encrypted_assertions {
            assertions.push(parse_assertion(&self.decrypter()?.decrypt(encrypted)?)?);
        }

        if assertions.len() != 1 {
            return Err(AuthError::InvalidMessage(format!(
                "response carries {} assertions, exactly one is accepted",
                assertions.len()
            )));
        }
        Ok(assertions.remove(0))
    }

    /// Absent bounds do not restrict.
    fn check_conditions(&self, conditions: &Conditions, now: DateTime<Utc>) -> AuthResult<()> {
        if let Some(not_before) = conditions.not_before {
            if not_before > now + self.skew() {
                return Err(AuthError::ExpiredOrNotYetValid(format!(
                    "assertion not valid before {}",
                    not_before
                )));
            }
        }
        if let Some(not_on_or_after) = conditions.not_on_or_after {
            if now - self.skew() >= not_on_or_after {
                return Err(AuthError::ExpiredOrNotYetValid(format!(
                    "assertion expired at {}",
                    not_on_or_after
                )));
            }
        }
        Ok(())
    }

    fn check_audience(&self, conditions: &Conditions) -> AuthResult<()> {
        for restriction in &conditions.audience_restrictions {
            if !restriction.iter().any(|a| a == &self.config.sp_entity_id) {
                return Err(AuthError::InvalidClaim(format!(
                    "{} is not an intended audience",
                    self.config.sp_entity_id
                )));
            }
        }
        Ok(())
    }

    /// At least one bearer confirmation must hold. Returns its expiry.
    fn check_bearer_confirmation(
        &self,
        confirmations: &[SubjectConfirmation],
        expected_request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<DateTime<Utc>>> {
        let mut last_error = AuthError::InvalidMessage(
            "assertion has no bearer subject confirmation".to_string(),
        );

        for confirmation in confirmations.iter().filter(|c| c.method == CONFIRMATION_BEARER) {
            match self.check_confirmation(confirmation, expected_request_id, now) {
                Ok(expiry) => return Ok(Some(expiry)),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn check_confirmation(
        &self,
        confirmation: &SubjectConfirmation,
        expected_request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<DateTime<Utc>> {
        let data = confirmation.data.as_ref().ok_or_else(|| {
            AuthError::InvalidMessage("bearer confirmation has no data".to_string())
        })?;

        match data.recipient.as_deref() {
            Some(recipient) if recipient == self.config.acs_url => {}
            other => {
                return Err(AuthError::InvalidClaim(format!(
                    "bearer recipient {:?} is not {}",
                    other, self.config.acs_url
                )))
            }
        }

        let not_on_or_after = data.not_on_or_after.ok_or_else(|| {
            AuthError::InvalidMessage("bearer confirmation has no NotOnOrAfter".to_string())
        })?;
        if now - self.skew() >= not_on_or_after {
            return Err(AuthError::ExpiredOrNotYetValid(format!(
                "bearer confirmation expired at {}",
                not_on_or_after
            )));
        }
        if let Some(not_before) = data.not_before {
            if not_before > now + self.skew() {
                return Err(AuthError::ExpiredOrNotYetValid(format!(
                    "bearer confirmation not valid before {}",
                    not_before
                )));
            }
        }

        if let Some(in_response_to) = data.in_response_to.as_deref() {
            if expected_request_id != Some(in_response_to) {
                return Err(AuthError::StateMismatch(format!(
                    "bearer confirmation answers {}",
                    in_response_to
                )));
            }
        }

        Ok(not_on_or_after)
    }
}

fn build_credentials(
    assertion: Assertion,
    name_id: NameId,
    issuer: String,
    conditions: &Conditions,
    statement: crate::saml::model::AuthnStatement,
    attributes: Vec<crate::saml::model::SamlAttribute>,
) -> Saml2Credentials {
    Saml2Credentials {
        name_id,
        issuer,
        attributes,
        not_before: conditions.not_before,
        not_on_or_after: conditions.not_on_or_after,
        session_index: statement.session_index,
        session_not_on_or_after: statement.session_not_on_or_after,
        authn_context_class_refs: statement.class_refs,
        message_id: assertion.id,
        authn_instant: statement.authn_instant,
    }
}
