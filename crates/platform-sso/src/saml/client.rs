//! SAML2 service provider client.

use crate::context::{RedirectInstruction, RequestContext};
use crate::credentials::{Credentials, LogoutCredentials, Saml2Credentials};
use crate::error::{AuthError, AuthResult};
use crate::generator::ValuePurpose;
use crate::logout::LogoutOutcome;
use crate::pipeline::FlowServices;
use crate::profile::{ProtocolMaterial, Saml2Material, UserProfile};
use crate::saml::binding::{
    decode_inbound, outbound_instruction, soap_envelope, SamlBinding, SamlInbound, SAML_REQUEST,
    SAML_RESPONSE,
};
use crate::saml::config::{IdpMetadata, IdpMetadataResolver, Saml2ClientConfig};
use crate::saml::logout_validator::{Saml2LogoutValidator, ValidatedLogoutRequest};
use crate::saml::messages::{authn_request, logout_request, logout_response, AuthnRequestParams};
use crate::saml::model::{SamlMessage, Status};
use crate::saml::response_validator::Saml2ResponseValidator;
use crate::saml::trust::{CredentialProvider, Decrypter, RequestSigner, TrustEngine};
use crate::session::{verify_correlation_value, CorrelationState};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Builder for [`Saml2Client`].
pub struct Saml2ClientBuilder {
    config: Saml2ClientConfig,
    resolver: Option<Arc<dyn IdpMetadataResolver>>,
    trust: Option<Arc<dyn TrustEngine>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    decrypter: Option<Arc<dyn Decrypter>>,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl Saml2ClientBuilder {
    /// IdP metadata source (required).
    pub fn idp_metadata(mut self, resolver: Arc<dyn IdpMetadataResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Signature trust engine (required).
    pub fn trust_engine(mut self, trust: Arc<dyn TrustEngine>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Trust anchors from outside the metadata.
    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Decrypter for encrypted assertions, NameIDs and attributes.
    pub fn decrypter(mut self, decrypter: Arc<dyn Decrypter>) -> Self {
        self.decrypter = Some(decrypter);
        self
    }

    /// Signer for outbound requests.
    pub fn request_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Validate the configuration against the IdP metadata and freeze the client.
    pub async fn build(self) -> AuthResult<Saml2Client> {
        self.config.validate()?;

        let resolver = self.resolver.ok_or_else(|| {
            AuthError::Configuration("SAML client needs an IdP metadata resolver".to_string())
        })?;
        let trust = self.trust.ok_or_else(|| {
            AuthError::Configuration("SAML client needs a trust engine".to_string())
        })?;

        let idp = resolver.load().await?;
        if idp.sso_url(self.config.authn_request_binding).is_none() {
            return Err(AuthError::Configuration(format!(
                "IdP {} has no SSO endpoint",
                idp.entity_id
            )));
        }
        if (self.config.sign_requests || idp.want_authn_requests_signed) && self.signer.is_none() {
            return Err(AuthError::Configuration(
                "signed requests are required but no request signer is configured".to_string(),
            ));
        }

        tracing::info!(
            sp_entity_id = %self.config.sp_entity_id,
            idp = %idp.entity_id,
            "SAML2 client initialized"
        );

        Ok(Saml2Client {
            response_validator: Saml2ResponseValidator::new(
                self.config.clone(),
                trust.clone(),
                self.decrypter.clone(),
            ),
            logout_validator: Saml2LogoutValidator::new(self.config.clone(), trust, self.decrypter),
            config: self.config,
            resolver,
            credentials: self.credentials,
            signer: self.signer,
        })
    }
}

/// SAML2 Web Browser SSO and Single Logout service provider.
pub struct Saml2Client {
    config: Saml2ClientConfig,
    resolver: Arc<dyn IdpMetadataResolver>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    signer: Option<Arc<dyn RequestSigner>>,
    response_validator: Saml2ResponseValidator,
    logout_validator: Saml2LogoutValidator,
}

impl std::fmt::Debug for Saml2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saml2Client")
            .field("config", &self.config)
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

impl Saml2Client {
    /// Start building a client.
    pub fn builder(config: Saml2ClientConfig) -> Saml2ClientBuilder {
        Saml2ClientBuilder {
            config,
            resolver: None,
            trust: None,
            credentials: None,
            decrypter: None,
            signer: None,
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &Saml2ClientConfig {
        &self.config
    }

    /// IdP metadata with the effective trust anchor.
    async fn idp(&self) -> AuthResult<IdpMetadata> {
        let mut idp = (*self.resolver.load().await?).clone();
        if let Some(provider) = &self.credentials {
            if let Some(anchor) = provider.credential(&idp.entity_id) {
                idp.trust_anchor = anchor;
            }
        }
        Ok(idp)
    }

    fn signer_for(&self, idp: &IdpMetadata) -> Option<&dyn RequestSigner> {
        if self.config.sign_requests || idp.want_authn_requests_signed {
            self.signer.as_deref()
        } else {
            None
        }
    }

    /// Send the browser to the IdP with an AuthnRequest.
    pub async fn build_redirect(
        &self,
        ctx: &RequestContext,
        flow: &FlowServices<'_>,
    ) -> AuthResult<RedirectInstruction> {
        let idp = self.idp().await?;
        let destination = idp.sso_url(self.config.authn_request_binding).ok_or_else(|| {
            AuthError::Configuration(format!("IdP {} has no SSO endpoint", idp.entity_id))
        })?;

        let request_id = flow.generator.generate(ValuePurpose::MessageId);
        let relay_state = flow.generator.generate(ValuePurpose::State);

        let mut xml = authn_request(&AuthnRequestParams {
            id: &request_id,
            destination,
            issuer: &self.config.sp_entity_id,
            acs_url: &self.config.acs_url,
            protocol_binding: SamlBinding::Post.uri(),
            name_id_format: self.config.name_id_policy_format.as_deref(),
            force_authn: self.config.force_authn,
            passive: self.config.passive,
            class_refs: &self.config.authn_context_class_refs,
            issue_instant: Utc::now(),
        });

        let binding: SamlBinding = self.config.authn_request_binding.into();
        let signer = self.signer_for(&idp);
        if let (SamlBinding::Post, Some(signer)) = (binding, signer) {
            xml = signer.sign_enveloped(&xml, &request_id)?;
        }

        let mut correlation = CorrelationState::new();
        correlation.state = Some(relay_state.clone());
        correlation.request_id = Some(request_id.clone());
        correlation.save(flow.sessions, ctx, flow.keys).await?;

        tracing::debug!(request_id = %request_id, idp = %idp.entity_id, "AuthnRequest built");
        outbound_instruction(
            binding,
            destination,
            SAML_REQUEST,
            &xml,
            Some(&relay_state),
            signer,
        )
    }

    /// Decode a SAML message from the request.
    pub fn extract(&self, ctx: &RequestContext) -> AuthResult<Option<Credentials>> {
        let Some(inbound) = decode_inbound(ctx)? else {
            return Ok(None);
        };

        Ok(Some(match inbound.message {
            SamlMessage::Response(_) => Credentials::Saml2(Box::new(inbound)),
            SamlMessage::LogoutRequest(_) | SamlMessage::LogoutResponse(_) => {
                Credentials::Logout(LogoutCredentials::Saml(Box::new(inbound)))
            }
        }))
    }

    /// Validate an authentication response and build the profile.
    pub async fn validate(
        &self,
        ctx: &RequestContext,
        inbound: &SamlInbound,
        flow: &FlowServices<'_>,
    ) -> AuthResult<UserProfile> {
        let correlation = CorrelationState::take(flow.sessions, ctx, flow.keys).await?;

        let solicited = matches!(
            &inbound.message,
            SamlMessage::Response(r) if r.in_response_to.is_some()
        );
        if solicited {
            verify_correlation_value(
                "RelayState",
                correlation.as_ref().and_then(|c| c.state.as_deref()),
                inbound.relay_state.as_deref(),
            )?;
        }

        let idp = self.idp().await?;
        let credentials = self
            .response_validator
            .validate(
                inbound,
                &idp,
                correlation.as_ref().and_then(|c| c.request_id.as_deref()),
                flow.replay,
            )
            .await?;

        Ok(build_profile(flow.client_name, credentials))
    }

    /// Validate an IdP-initiated LogoutRequest.
    pub async fn validate_logout_request(
        &self,
        inbound: &SamlInbound,
        flow: &FlowServices<'_>,
    ) -> AuthResult<ValidatedLogoutRequest> {
        let idp = self.idp().await?;
        self.logout_validator
            .validate_request(inbound, &idp, flow.replay, Utc::now())
            .await
    }

    /// Answer a validated LogoutRequest with a Success LogoutResponse.
    pub async fn logout_response_outcome(
        &self,
        request: &ValidatedLogoutRequest,
        flow: &FlowServices<'_>,
    ) -> AuthResult<LogoutOutcome> {
        let idp = self.idp().await?;
        let response_id = flow.generator.generate(ValuePurpose::MessageId);

        if request.binding == SamlBinding::Soap {
            let xml = logout_response(
                &response_id,
                &request.request_id,
                None,
                &self.config.sp_entity_id,
                &Status::success(),
                Utc::now(),
            );
            return Ok(LogoutOutcome::SoapResponse(soap_envelope(&xml)));
        }

        let destination = idp.slo_response_url().ok_or_else(|| {
            AuthError::Configuration(format!("IdP {} has no SLO endpoint", idp.entity_id))
        })?;
        let mut xml = logout_response(
            &response_id,
            &request.request_id,
            Some(destination),
            &self.config.sp_entity_id,
            &Status::success(),
            Utc::now(),
        );

        let binding: SamlBinding = self.config.authn_request_binding.into();
        let signer = self.signer_for(&idp);
        if let (SamlBinding::Post, Some(signer)) = (binding, signer) {
            xml = signer.sign_enveloped(&xml, &response_id)?;
        }

        Ok(LogoutOutcome::Redirect(outbound_instruction(
            binding,
            destination,
            SAML_RESPONSE,
            &xml,
            request.relay_state.as_deref(),
            signer,
        )?))
    }

    /// Validate the LogoutResponse to our own LogoutRequest.
    pub async fn validate_logout_response(
        &self,
        ctx: &RequestContext,
        inbound: &SamlInbound,
        flow: &FlowServices<'_>,
    ) -> AuthResult<LogoutOutcome> {
        let expected = flow
            .sessions
            .remove(ctx, &flow.keys.logout_request_id())
            .await?;
        let idp = self.idp().await?;

        let status = self.logout_validator.validate_response(
            inbound,
            &idp,
            expected.as_deref(),
            Utc::now(),
        )?;
        tracing::info!(status = ?status, "SAML single logout completed");

        Ok(match &self.config.post_logout_redirect_url {
            Some(url) => LogoutOutcome::Redirect(RedirectInstruction::Location(url.clone())),
            None => LogoutOutcome::Acknowledged,
        })
    }

    /// SP-initiated logout: send a LogoutRequest for the profile's session.
    pub async fn build_logout_redirect(
        &self,
        ctx: &RequestContext,
        profile: Option<&UserProfile>,
        flow: &FlowServices<'_>,
    ) -> AuthResult<RedirectInstruction> {
        let material = profile.and_then(|p| p.saml2()).ok_or_else(|| {
            AuthError::Unsupported("SAML logout needs a SAML2 profile".to_string())
        })?;

        let idp = self.idp().await?;
        let destination = idp.slo_url.as_deref().ok_or_else(|| {
            AuthError::Unsupported(format!("IdP {} has no SLO endpoint", idp.entity_id))
        })?;

        let request_id = flow.generator.generate(ValuePurpose::MessageId);
        let mut xml = logout_request(
            &request_id,
            destination,
            &self.config.sp_entity_id,
            &material.name_id,
            material.session_index.as_deref(),
            Utc::now(),
        );

        let binding: SamlBinding = self.config.authn_request_binding.into();
        let signer = self.signer_for(&idp);
        if let (SamlBinding::Post, Some(signer)) = (binding, signer) {
            xml = signer.sign_enveloped(&xml, &request_id)?;
        }

        flow.sessions
            .set(ctx, &flow.keys.logout_request_id(), request_id.clone())
            .await?;

        tracing::debug!(request_id = %request_id, "LogoutRequest built");
        outbound_instruction(binding, destination, SAML_REQUEST, &xml, None, signer)
    }
}

fn attribute_value(values: &[String]) -> Value {
    match values {
        [single] => Value::String(single.clone()),
        many => Value::Array(many.iter().cloned().map(Value::String).collect()),
    }
}

fn build_profile(client_name: &str, credentials: Saml2Credentials) -> UserProfile {
    let mut attributes = std::collections::HashMap::new();
    for attribute in &credentials.attributes {
        let value = attribute_value(&attribute.values);
        if let Some(friendly) = &attribute.friendly_name {
            attributes.insert(friendly.clone(), value.clone());
        }
        attributes.insert(attribute.name.clone(), value);
    }

    let material = Saml2Material {
        issuer: credentials.issuer,
        name_id: credentials.name_id.clone(),
        session_index: credentials.session_index,
        assertion_id: credentials.message_id,
        authn_context_class_refs: credentials.authn_context_class_refs,
        not_on_or_after: credentials.not_on_or_after,
    };

    let mut profile = UserProfile::new(
        credentials.name_id.value,
        client_name,
        ProtocolMaterial::Saml2(material),
    );
    profile.attributes = attributes;
    profile
}
