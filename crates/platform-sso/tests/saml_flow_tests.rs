//! End-to-end tests for SAML2 Web Browser SSO and Single Logout.
//!
//! XML signature verification is delegated to a test trust engine that
//! accepts a fixed marker value, so the messages below can be written by
//! hand. Everything else (bindings, correlation, conditions, replay, session
//! tracking) runs for real.
//!
//! Scenarios:
//! 1. AuthnRequest -> Response -> profile
//! 2. condition windows and unsolicited responses
//! 3. replayed and concurrently replayed assertions
//! 4. IdP-initiated logout over HTTP-Redirect and SOAP
//! 5. SP-initiated logout, including partial logout

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use platform_sso::saml::binding::{deflate_redirect, encode_post, inflate_redirect, soap_envelope};
use platform_sso::saml::{
    IdpMetadata, Saml2Client, Saml2ClientConfig, SignedObject, StaticIdpMetadataResolver,
    TrustAnchor, TrustEngine,
};
use platform_sso::{
    AuthError, AuthResult, AuthenticationPipeline, InMemorySessionStore, LogoutOutcome,
    PipelineConfig, RedirectInstruction, RequestContext, UserProfile, ValueGenerator,
    ValuePurpose,
};
use std::sync::Arc;

const IDP: &str = "https://idp.example.com";
const IDP_SSO: &str = "https://idp.example.com/sso";
const IDP_SLO: &str = "https://idp.example.com/slo";
const SP: &str = "https://sp.example.com";
const ACS: &str = "https://sp.example.com/acs";
const SLO: &str = "https://sp.example.com/slo";
const SESSION: &str = "browser-session-1";

const REQUEST_ID: &str = "_req1";
const RELAY_STATE: &str = "relay-5d2c8e1a";

/// base64("trusted")
const TRUSTED: &str = "dHJ1c3RlZA==";

/// Accepts signatures carrying the marker value.
struct MarkerTrust;

impl TrustEngine for MarkerTrust {
    fn verify(&self, object: &SignedObject<'_>, _anchor: &TrustAnchor) -> AuthResult<bool> {
        Ok(match object {
            SignedObject::Enveloped { signature, .. } => signature.signature_value == TRUSTED,
            SignedObject::Detached { signature, .. } => *signature == b"trusted",
        })
    }
}

struct FixedGenerator;

impl ValueGenerator for FixedGenerator {
    fn generate(&self, purpose: ValuePurpose) -> String {
        match purpose {
            ValuePurpose::MessageId => REQUEST_ID.to_string(),
            ValuePurpose::State => RELAY_STATE.to_string(),
            _ => "value-1".to_string(),
        }
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn signature(id: &str) -> String {
    format!(
        r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignedInfo><ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"/><ds:Reference URI="#{}"/></ds:SignedInfo><ds:SignatureValue>{}</ds:SignatureValue></ds:Signature>"##,
        id, TRUSTED
    )
}

/// A Response with one signed assertion.
struct ResponseBuilder {
    assertion_id: String,
    in_response_to: Option<String>,
    not_before: DateTime<Utc>,
    not_on_or_after: DateTime<Utc>,
}

impl ResponseBuilder {
    fn new(assertion_id: &str) -> Self {
        let now = Utc::now();
        Self {
            assertion_id: assertion_id.to_string(),
            in_response_to: Some(REQUEST_ID.to_string()),
            not_before: now - Duration::minutes(1),
            not_on_or_after: now + Duration::minutes(5),
        }
    }

    fn xml(&self) -> String {
        let now = ts(Utc::now());
        let irt_attr = self
            .in_response_to
            .as_ref()
            .map(|irt| format!(r#" InResponseTo="{}""#, irt))
            .unwrap_or_default();

        let assertion = format!(
            r#"<saml:Assertion ID="{id}" Version="2.0" IssueInstant="{now}"><saml:Issuer>{IDP}</saml:Issuer>{sig}<saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">jdoe@example.com</saml:NameID><saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer"><saml:SubjectConfirmationData Recipient="{ACS}" NotOnOrAfter="{exp}"{irt_attr}/></saml:SubjectConfirmation></saml:Subject><saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}"><saml:AudienceRestriction><saml:Audience>{SP}</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AuthnStatement AuthnInstant="{now}" SessionIndex="_s1"><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement><saml:AttributeStatement><saml:Attribute Name="urn:oid:0.9.2342.19200300.100.1.3" FriendlyName="mail"><saml:AttributeValue>jdoe@example.com</saml:AttributeValue></saml:Attribute><saml:Attribute Name="groups"><saml:AttributeValue>staff</saml:AttributeValue><saml:AttributeValue>admins</saml:AttributeValue></saml:Attribute></saml:AttributeStatement></saml:Assertion>"#,
            id = self.assertion_id,
            sig = signature(&self.assertion_id),
            exp = ts(Utc::now() + Duration::minutes(5)),
            nb = ts(self.not_before),
            noa = ts(self.not_on_or_after),
        );

        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_resp-{id}" Version="2.0" IssueInstant="{now}" Destination="{ACS}"{irt_attr}><saml:Issuer>{IDP}</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>{assertion}</samlp:Response>"#,
            id = self.assertion_id,
        )
    }

    fn post(&self, session: &str) -> RequestContext {
        let mut ctx = RequestContext::post(ACS, session).with_form_param("SAMLResponse", encode_post(&self.xml()));
        if self.in_response_to.is_some() {
            ctx = ctx.with_form_param("RelayState", RELAY_STATE);
        }
        ctx
    }
}

fn logout_request_xml(id: &str, signed: bool) -> String {
    format!(
        r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{now}" Destination="{SLO}"><saml:Issuer>{IDP}</saml:Issuer>{sig}<saml:NameID>jdoe@example.com</saml:NameID><samlp:SessionIndex>_s1</samlp:SessionIndex></samlp:LogoutRequest>"#,
        now = ts(Utc::now()),
        sig = if signed { signature(id) } else { String::new() },
    )
}

fn logout_response_xml(id: &str, in_response_to: &str, status: &str) -> String {
    format!(
        r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{now}" Destination="{SLO}" InResponseTo="{in_response_to}"><saml:Issuer>{IDP}</saml:Issuer>{sig}<samlp:Status>{status}</samlp:Status></samlp:LogoutResponse>"#,
        now = ts(Utc::now()),
        sig = signature(id),
    )
}

/// Redirect-binding query for a message, signed with the marker.
fn signed_redirect_query(param: &str, xml: &str, relay_state: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair(param, &deflate_redirect(xml).unwrap())
        .append_pair("RelayState", relay_state)
        .append_pair("SigAlg", "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256")
        .append_pair("Signature", TRUSTED)
        .finish()
}

struct TestFixture {
    sessions: Arc<InMemorySessionStore>,
    pipeline: AuthenticationPipeline,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(customize: impl FnOnce(&mut Saml2ClientConfig)) -> Self {
        let mut config = Saml2ClientConfig::new(SP, ACS);
        config.slo_url = Some(SLO.to_string());
        config.post_logout_redirect_url = Some("https://sp.example.com/goodbye".to_string());
        customize(&mut config);

        let mut metadata = IdpMetadata::new(IDP);
        metadata.sso_redirect_url = Some(IDP_SSO.to_string());
        metadata.slo_url = Some(IDP_SLO.to_string());

        let client = Saml2Client::builder(config)
            .idp_metadata(Arc::new(StaticIdpMetadataResolver::new(metadata)))
            .trust_engine(Arc::new(MarkerTrust))
            .build()
            .await
            .expect("client builds");

        let sessions = Arc::new(InMemorySessionStore::new());
        let pipeline = AuthenticationPipeline::new(
            PipelineConfig::new("saml"),
            client,
            sessions.clone(),
        )
        .expect("pipeline builds")
        .with_generator(Arc::new(FixedGenerator));

        Self { sessions, pipeline }
    }

    async fn start(&self, session: &str) -> RedirectInstruction {
        let ctx = RequestContext::get("https://sp.example.com/login", session);
        self.pipeline.build_redirect(&ctx).await.unwrap()
    }

    async fn login(&self, assertion_id: &str) -> (RequestContext, UserProfile) {
        self.start(SESSION).await;
        let mut ctx = ResponseBuilder::new(assertion_id).post(SESSION);
        let profile = self.pipeline.handle_callback(&mut ctx).await.unwrap();
        (ctx, profile)
    }
}

// =============================================================================
// Test 1: AuthnRequest -> Response -> profile
// =============================================================================

#[tokio::test]
async fn test_authn_request_redirect() {
    let fixture = TestFixture::new().await;

    let redirect = fixture.start(SESSION).await;
    let location = url::Url::parse(redirect.location().unwrap()).unwrap();
    assert_eq!(
        format!("{}://{}{}", location.scheme(), location.host_str().unwrap(), location.path()),
        IDP_SSO
    );

    let params: std::collections::HashMap<String, String> =
        location.query_pairs().into_owned().collect();
    assert_eq!(params["RelayState"], RELAY_STATE);

    let xml = inflate_redirect(&params["SAMLRequest"]).unwrap();
    assert!(xml.contains(r#"ID="_req1""#));
    assert!(xml.contains(&format!(r#"AssertionConsumerServiceURL="{}""#, ACS)));
    assert!(xml.contains(&format!("<saml:Issuer>{}</saml:Issuer>", SP)));
}

#[tokio::test]
async fn test_login_produces_profile() {
    let fixture = TestFixture::new().await;

    let (ctx, profile) = fixture.login("_a1").await;

    assert_eq!(profile.id, "jdoe@example.com");
    assert_eq!(profile.client_name, "saml");
    assert_eq!(profile.email(), Some("jdoe@example.com"));
    assert_eq!(
        profile.attribute("groups"),
        Some(&serde_json::json!(["staff", "admins"]))
    );

    let material = profile.saml2().unwrap();
    assert_eq!(material.issuer, IDP);
    assert_eq!(material.session_index.as_deref(), Some("_s1"));
    assert_eq!(material.assertion_id, "_a1");
    assert_eq!(
        material.authn_context_class_refs,
        vec!["urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport".to_string()]
    );

    assert_ne!(ctx.session_id, SESSION);
    assert!(fixture.sessions.exists(&ctx.session_id).await);
}

#[tokio::test]
async fn test_relay_state_mismatch() {
    let fixture = TestFixture::new().await;
    fixture.start(SESSION).await;

    let mut ctx = RequestContext::post(ACS, SESSION)
        .with_form_param("SAMLResponse", encode_post(&ResponseBuilder::new("_a1").xml()))
        .with_form_param("RelayState", "relay-5d2c8e1b");

    let result = fixture.pipeline.handle_callback(&mut ctx).await;
    assert!(matches!(result, Err(AuthError::StateMismatch(_))));
}

#[tokio::test]
async fn test_redirect_message_must_be_the_signed_one() {
    let fixture = TestFixture::new().await;
    fixture.start(SESSION).await;

    // Unsigned response for another user, smuggled ahead of a signed query
    // under percent-encoded parameter names
    let forged = ResponseBuilder::new("_forged").xml().replace("jdoe@example.com", "admin@example.com");
    let smuggled: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("SAMLResponse", &deflate_redirect(&forged).unwrap())
        .append_pair("RelayState", RELAY_STATE)
        .finish()
        .replacen("SAMLResponse=", "SAML%52esponse=", 1)
        .replacen("&RelayState=", "&Relay%53tate=", 1);
    let signed = signed_redirect_query(
        "SAMLResponse",
        &logout_response_xml("_lresp9", REQUEST_ID, ""),
        RELAY_STATE,
    );

    let mut ctx = RequestContext::get(format!("{}?{}&{}", ACS, smuggled, signed), SESSION);
    let result = fixture.pipeline.handle_callback(&mut ctx).await;
    assert!(matches!(result, Err(AuthError::InvalidMessage(_))));
    assert_eq!(ctx.session_id, SESSION);
}

// =============================================================================
// Test 2: conditions and correlation
// =============================================================================

#[tokio::test]
async fn test_expired_conditions_rejected() {
    let fixture = TestFixture::new().await;
    fixture.start(SESSION).await;

    let mut response = ResponseBuilder::new("_a1");
    response.not_before = Utc::now() - Duration::minutes(20);
    response.not_on_or_after = Utc::now() - Duration::minutes(10);

    let result = fixture.pipeline.handle_callback(&mut response.post(SESSION)).await;
    assert!(matches!(result, Err(AuthError::ExpiredOrNotYetValid(_))));
}

#[tokio::test]
async fn test_not_yet_valid_conditions_rejected() {
    let fixture = TestFixture::new().await;
    fixture.start(SESSION).await;

    let mut response = ResponseBuilder::new("_a1");
    response.not_before = Utc::now() + Duration::minutes(10);
    response.not_on_or_after = Utc::now() + Duration::minutes(20);

    let result = fixture.pipeline.handle_callback(&mut response.post(SESSION)).await;
    assert!(matches!(result, Err(AuthError::ExpiredOrNotYetValid(_))));
}

#[tokio::test]
async fn test_conditions_within_skew_accepted() {
    let fixture = TestFixture::new().await;
    fixture.start(SESSION).await;

    // Default skew is two minutes
    let mut response = ResponseBuilder::new("_a1");
    response.not_before = Utc::now() + Duration::seconds(60);

    let result = fixture.pipeline.handle_callback(&mut response.post(SESSION)).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_unsolicited_response_rejected_by_default() {
    let fixture = TestFixture::new().await;

    let mut response = ResponseBuilder::new("_a1");
    response.in_response_to = None;

    let result = fixture.pipeline.handle_callback(&mut response.post(SESSION)).await;
    assert!(matches!(result, Err(AuthError::StateMismatch(_))));
}

#[tokio::test]
async fn test_unsolicited_response_when_allowed() {
    let fixture = TestFixture::with_config(|c| c.allow_unsolicited_responses = true).await;

    let mut response = ResponseBuilder::new("_a1");
    response.in_response_to = None;

    let profile = fixture
        .pipeline
        .handle_callback(&mut response.post(SESSION))
        .await
        .unwrap();
    assert_eq!(profile.id, "jdoe@example.com");
}

// =============================================================================
// Test 3: replay
// =============================================================================

#[tokio::test]
async fn test_replayed_assertion_rejected() {
    let fixture = TestFixture::new().await;
    fixture.login("_a1").await;

    // Same assertion in a fresh login attempt
    fixture.start("browser-session-2").await;
    let mut ctx = ResponseBuilder::new("_a1").post("browser-session-2");
    let result = fixture.pipeline.handle_callback(&mut ctx).await;
    assert!(matches!(result, Err(AuthError::Replay(_))));
}

#[tokio::test]
async fn test_concurrent_replay_only_one_wins() {
    let fixture = TestFixture::new().await;
    fixture.start("browser-a").await;
    fixture.start("browser-b").await;

    let response = ResponseBuilder::new("_a-concurrent");
    let mut ctx_a = response.post("browser-a");
    let mut ctx_b = response.post("browser-b");

    let (a, b) = tokio::join!(
        fixture.pipeline.handle_callback(&mut ctx_a),
        fixture.pipeline.handle_callback(&mut ctx_b),
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);
    let failure = if a.is_err() { a } else { b };
    assert!(matches!(failure, Err(AuthError::Replay(_))));
}

// =============================================================================
// Test 4: IdP-initiated logout
// =============================================================================

#[tokio::test]
async fn test_front_channel_logout_request() {
    let fixture = TestFixture::new().await;
    let (login_ctx, _) = fixture.login("_a1").await;

    let query = signed_redirect_query("SAMLRequest", &logout_request_xml("_lr1", false), "idp-relay");
    let ctx = RequestContext::get(format!("{}?{}", SLO, query), login_ctx.session_id.clone());

    let outcome = fixture.pipeline.handle_logout(&ctx).await.unwrap();
    assert!(!fixture.sessions.exists(&login_ctx.session_id).await);

    let location = match outcome {
        LogoutOutcome::Redirect(RedirectInstruction::Location(location)) => location,
        other => panic!("expected a redirect, got {:?}", other),
    };
    assert!(location.starts_with(IDP_SLO));

    let location = url::Url::parse(&location).unwrap();
    let params: std::collections::HashMap<String, String> =
        location.query_pairs().into_owned().collect();
    assert_eq!(params["RelayState"], "idp-relay");

    let response = inflate_redirect(&params["SAMLResponse"]).unwrap();
    assert!(response.contains(r#"InResponseTo="_lr1""#));
    assert!(response.contains("urn:oasis:names:tc:SAML:2.0:status:Success"));
}

#[tokio::test]
async fn test_unsigned_logout_request_rejected() {
    let fixture = TestFixture::new().await;
    let (login_ctx, _) = fixture.login("_a1").await;

    let encoded = deflate_redirect(&logout_request_xml("_lr1", false)).unwrap();
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("SAMLRequest", &encoded)
        .finish();
    let ctx = RequestContext::get(format!("{}?{}", SLO, query), login_ctx.session_id.clone());

    let result = fixture.pipeline.handle_logout(&ctx).await;
    assert!(matches!(result, Err(AuthError::Signature(_))));
    assert!(fixture.sessions.exists(&login_ctx.session_id).await);
}

#[tokio::test]
async fn test_soap_back_channel_logout_request() {
    let fixture = TestFixture::new().await;
    let (login_ctx, _) = fixture.login("_a1").await;

    let ctx = RequestContext::post(SLO, "")
        .with_body(soap_envelope(&logout_request_xml("_lr2", true)));
    let outcome = fixture.pipeline.handle_logout(&ctx).await.unwrap();

    assert!(!fixture.sessions.exists(&login_ctx.session_id).await);
    let envelope = match outcome {
        LogoutOutcome::SoapResponse(envelope) => envelope,
        other => panic!("expected a SOAP response, got {:?}", other),
    };
    assert!(envelope.contains("Envelope"));
    assert!(envelope.contains("LogoutResponse"));
    assert!(envelope.contains(r#"InResponseTo="_lr2""#));

    // Same request again
    let result = fixture.pipeline.handle_logout(&ctx).await;
    assert!(matches!(result, Err(AuthError::Replay(_))));
}

// =============================================================================
// Test 5: SP-initiated logout
// =============================================================================

async fn sp_logout(fixture: &TestFixture) -> RequestContext {
    let (ctx, profile) = fixture.login("_a1").await;
    let redirect = fixture
        .pipeline
        .build_logout_redirect(&ctx, Some(&profile))
        .await
        .unwrap();
    assert!(redirect.location().unwrap().starts_with(IDP_SLO));
    ctx
}

#[tokio::test]
async fn test_sp_initiated_logout_completes() {
    let fixture = TestFixture::new().await;
    let ctx = sp_logout(&fixture).await;
    assert!(fixture.sessions.exists(&ctx.session_id).await);

    let status = r#"<samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/>"#;
    let callback = RequestContext::post(SLO, ctx.session_id.clone()).with_form_param(
        "SAMLResponse",
        encode_post(&logout_response_xml("_lresp1", REQUEST_ID, status)),
    );

    let outcome = fixture.pipeline.handle_logout(&callback).await.unwrap();
    assert_eq!(
        outcome,
        LogoutOutcome::Redirect(RedirectInstruction::Location(
            "https://sp.example.com/goodbye".to_string()
        ))
    );
    assert!(!fixture.sessions.exists(&ctx.session_id).await);
}

#[tokio::test]
async fn test_logout_response_for_other_request() {
    let fixture = TestFixture::new().await;
    let ctx = sp_logout(&fixture).await;

    let status = r#"<samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/>"#;
    let callback = RequestContext::post(SLO, ctx.session_id.clone()).with_form_param(
        "SAMLResponse",
        encode_post(&logout_response_xml("_lresp1", "_someone-else", status)),
    );

    let result = fixture.pipeline.handle_logout(&callback).await;
    assert!(matches!(result, Err(AuthError::StateMismatch(_))));
}

#[tokio::test]
async fn test_unsolicited_logout_response() {
    let fixture = TestFixture::new().await;

    let status = r#"<samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/>"#;
    let callback = RequestContext::post(SLO, SESSION).with_form_param(
        "SAMLResponse",
        encode_post(&logout_response_xml("_lresp1", REQUEST_ID, status)),
    );

    let result = fixture.pipeline.handle_logout(&callback).await;
    assert!(matches!(result, Err(AuthError::StateMismatch(_))));
}

const PARTIAL: &str = r#"<samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Responder"><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:PartialLogout"/></samlp:StatusCode>"#;

#[tokio::test]
async fn test_partial_logout_rejected_by_default() {
    let fixture = TestFixture::new().await;
    let ctx = sp_logout(&fixture).await;

    let callback = RequestContext::post(SLO, ctx.session_id.clone()).with_form_param(
        "SAMLResponse",
        encode_post(&logout_response_xml("_lresp1", REQUEST_ID, PARTIAL)),
    );

    match fixture.pipeline.handle_logout(&callback).await {
        Err(AuthError::Protocol { code, .. }) => {
            assert_eq!(code, "urn:oasis:names:tc:SAML:2.0:status:Responder")
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(fixture.sessions.exists(&ctx.session_id).await);
}

#[tokio::test]
async fn test_partial_logout_accepted_when_configured() {
    let fixture = TestFixture::with_config(|c| c.accept_partial_logout = true).await;
    let ctx = sp_logout(&fixture).await;

    let callback = RequestContext::post(SLO, ctx.session_id.clone()).with_form_param(
        "SAMLResponse",
        encode_post(&logout_response_xml("_lresp1", REQUEST_ID, PARTIAL)),
    );

    let outcome = fixture.pipeline.handle_logout(&callback).await.unwrap();
    assert!(matches!(outcome, LogoutOutcome::Redirect(_)));
    assert!(!fixture.sessions.exists(&ctx.session_id).await);
}
