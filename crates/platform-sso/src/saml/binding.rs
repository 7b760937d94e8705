//! SAML2 bindings: HTTP-Redirect, HTTP-POST and SOAP.

use crate::context::{append_query, HttpMethod, RedirectInstruction, RequestContext};
use crate::error::{AuthError, AuthResult};
use crate::saml::model::SamlMessage;
use crate::saml::parser::parse_message;
use crate::saml::trust::RequestSigner;
use crate::saml::xml::XmlElement;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{Read, Write};

/// Largest encoded message accepted, before base64 decoding.
const MAX_ENCODED_SIZE: usize = 512 * 1024;

/// Largest inflated redirect message accepted (deflate bomb guard).
const MAX_INFLATED_SIZE: u64 = 512 * 1024;

/// Query / form parameter names.
pub const SAML_REQUEST: &str = "SAMLRequest";
/// Response parameter name.
pub const SAML_RESPONSE: &str = "SAMLResponse";
/// Relay state parameter name.
pub const RELAY_STATE: &str = "RelayState";
/// Signature algorithm parameter name.
pub const SIG_ALG: &str = "SigAlg";
/// Signature parameter name.
pub const SIGNATURE: &str = "Signature";

/// Transport a SAML message arrived on or leaves by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamlBinding {
    /// Deflated and base64 encoded in the query string
    #[default]
    Redirect,
    /// Base64 encoded in an auto-submitted form
    Post,
    /// SOAP envelope, server to server
    Soap,
}

impl SamlBinding {
    /// Binding URI used in metadata and requests.
    pub fn uri(&self) -> &'static str {
        match self {
            SamlBinding::Redirect => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect",
            SamlBinding::Post => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
            SamlBinding::Soap => "urn:oasis:names:tc:SAML:2.0:bindings:SOAP",
        }
    }
}

/// Detached signature of an HTTP-Redirect message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectSignature {
    /// `SigAlg` URI
    pub sig_alg: String,

    /// `Signature`, base64
    pub signature: String,

    /// Exact octets the signature covers
    pub signed_content: String,
}

/// Decoded inbound SAML message with its transport details.
#[derive(Debug, Clone)]
pub struct SamlInbound {
    /// Parsed message
    pub message: SamlMessage,

    /// Decoded XML document
    pub xml: String,

    /// Binding it arrived on
    pub binding: SamlBinding,

    /// `RelayState`
    pub relay_state: Option<String>,

    /// Detached signature, HTTP-Redirect only
    pub redirect_signature: Option<RedirectSignature>,
}

fn check_encoded_size(encoded: &str) -> AuthResult<()> {
    if encoded.len() > MAX_ENCODED_SIZE {
        return Err(AuthError::InvalidMessage(format!(
            "encoded SAML message exceeds maximum size ({} > {} bytes)",
            encoded.len(),
            MAX_ENCODED_SIZE
        )));
    }
    Ok(())
}

/// Decode an HTTP-POST message (base64).
pub fn decode_post(encoded: &str) -> AuthResult<String> {
    check_encoded_size(encoded)?;
    let compact: String = encoded.split_whitespace().collect();
    let decoded = STANDARD
        .decode(compact)
        .map_err(|e| AuthError::InvalidMessage(format!("base64 decode failed: {}", e)))?;
    String::from_utf8(decoded)
        .map_err(|e| AuthError::InvalidMessage(format!("invalid UTF-8: {}", e)))
}

/// Decode an HTTP-Redirect message (base64 of raw deflate).
pub fn inflate_redirect(encoded: &str) -> AuthResult<String> {
    check_encoded_size(encoded)?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AuthError::InvalidMessage(format!("base64 decode failed: {}", e)))?;

    let decoder = DeflateDecoder::new(&decoded[..]);
    let mut xml = String::new();
    decoder
        .take(MAX_INFLATED_SIZE)
        .read_to_string(&mut xml)
        .map_err(|e| AuthError::InvalidMessage(format!("deflate decode failed: {}", e)))?;

    if xml.len() as u64 >= MAX_INFLATED_SIZE {
        return Err(AuthError::InvalidMessage(
            "inflated SAML message exceeds maximum size".to_string(),
        ));
    }
    Ok(xml)
}

/// Encode a message for HTTP-Redirect.
pub fn deflate_redirect(xml: &str) -> AuthResult<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| AuthError::Internal(format!("deflate failed: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| AuthError::Internal(format!("deflate failed: {}", e)))?;
    Ok(STANDARD.encode(compressed))
}

/// Encode a message for HTTP-POST.
pub fn encode_post(xml: &str) -> String {
    STANDARD.encode(xml.as_bytes())
}

/// Wrap a message in a SOAP 1.1 envelope.
pub fn soap_envelope(inner: &str) -> String {
    format!(
        "<soap11:Envelope xmlns:soap11=\"http://schemas.xmlsoap.org/soap/envelope/\">\
         <soap11:Body>{}</soap11:Body></soap11:Envelope>",
        inner
    )
}

/// Source text of the first element inside a SOAP `Body`.
pub fn extract_soap_body(envelope: &str) -> AuthResult<String> {
    if envelope.len() > MAX_ENCODED_SIZE {
        return Err(AuthError::InvalidMessage(
            "SOAP message exceeds maximum size".to_string(),
        ));
    }

    let root = XmlElement::parse(envelope)?;
    if root.name != "Envelope" {
        return Err(AuthError::InvalidMessage(format!(
            "expected SOAP Envelope, found <{}>",
            root.name
        )));
    }

    root.child("Body")
        .and_then(|body| body.children.first())
        .map(|message| message.source(envelope).to_string())
        .ok_or_else(|| AuthError::InvalidMessage("SOAP Body is empty".to_string()))
}

/// Parameters whose bytes a redirect binding signature covers or carries.
const REDIRECT_PARAMS: [&str; 5] = [SAML_REQUEST, SAML_RESPONSE, RELAY_STATE, SIG_ALG, SIGNATURE];

/// One redirect binding parameter: the segment as received and its
/// decoded value.
#[derive(Debug, Clone)]
struct RedirectParam<'a> {
    raw: &'a str,
    value: String,
}

/// Redirect binding parameters of a raw query string.
///
/// Keys are compared after percent-decoding, so `SAML%52esponse` counts as
/// `SAMLResponse`. Each parameter may appear once; the decoded value and the
/// signed octets both come from that single segment.
#[derive(Debug)]
pub struct RedirectQuery<'a> {
    params: HashMap<&'static str, RedirectParam<'a>>,
}

impl<'a> RedirectQuery<'a> {
    /// Split a raw query string, rejecting repeated SAML parameters.
    pub fn parse(query: &'a str) -> AuthResult<Self> {
        let mut params = HashMap::new();
        for raw in query.split('&').filter(|segment| !segment.is_empty()) {
            let Some((key, value)) = url::form_urlencoded::parse(raw.as_bytes()).next() else {
                continue;
            };
            let Some(name) = REDIRECT_PARAMS.iter().copied().find(|name| *name == key) else {
                continue;
            };

            let param = RedirectParam {
                raw,
                value: value.into_owned(),
            };
            if params.insert(name, param).is_some() {
                return Err(AuthError::InvalidMessage(format!(
                    "{} appears more than once in the query",
                    name
                )));
            }
        }
        Ok(Self { params })
    }

    /// Decoded value of a parameter.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|param| param.value.as_str())
    }

    /// Octets covered by the signature over `message_param`.
    ///
    /// Built from the segments as received: re-encoding decoded values
    /// would not reproduce the signer's bytes.
    pub fn signed_content(&self, message_param: &str) -> Option<String> {
        let mut parts = vec![self.params.get(message_param)?.raw];
        if let Some(relay) = self.params.get(RELAY_STATE) {
            parts.push(relay.raw);
        }
        parts.push(self.params.get(SIG_ALG)?.raw);
        Some(parts.join("&"))
    }
}

/// Build an HTTP-Redirect URL, signing it when a signer is given.
pub fn build_redirect_url(
    endpoint: &str,
    message_param: &str,
    xml: &str,
    relay_state: Option<&str>,
    signer: Option<&dyn RequestSigner>,
) -> AuthResult<String> {
    let mut params: Vec<(&str, String)> = vec![(message_param, deflate_redirect(xml)?)];
    if let Some(relay) = relay_state {
        params.push((RELAY_STATE, relay.to_string()));
    }

    let Some(signer) = signer else {
        return Ok(append_query(endpoint, &params));
    };

    params.push((SIG_ALG, signer.algorithm().to_string()));
    let signed_content: String = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();
    let signature = STANDARD.encode(signer.sign_detached(signed_content.as_bytes())?);

    let signature_param: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair(SIGNATURE, &signature)
        .finish();
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    Ok(format!(
        "{}{}{}&{}",
        endpoint, separator, signed_content, signature_param
    ))
}

/// Build the browser instruction for an outbound message.
pub fn outbound_instruction(
    binding: SamlBinding,
    endpoint: &str,
    message_param: &str,
    xml: &str,
    relay_state: Option<&str>,
    signer: Option<&dyn RequestSigner>,
) -> AuthResult<RedirectInstruction> {
    match binding {
        SamlBinding::Redirect => Ok(RedirectInstruction::Location(build_redirect_url(
            endpoint,
            message_param,
            xml,
            relay_state,
            signer,
        )?)),
        SamlBinding::Post => {
            let mut fields = vec![(message_param.to_string(), encode_post(xml))];
            if let Some(relay) = relay_state {
                fields.push((RELAY_STATE.to_string(), relay.to_string()));
            }
            Ok(RedirectInstruction::FormPost {
                action: endpoint.to_string(),
                fields,
            })
        }
        SamlBinding::Soap => Err(AuthError::Unsupported(
            "SOAP cannot carry a browser redirect".to_string(),
        )),
    }
}

/// Find and decode a SAML message on the request.
///
/// POST with a body that is not a form is treated as SOAP. Otherwise
/// `SAMLResponse` / `SAMLRequest` are looked up in the form (HTTP-POST) or
/// the query (HTTP-Redirect). Returns `Ok(None)` when the request carries no
/// SAML message.
pub fn decode_inbound(ctx: &RequestContext) -> AuthResult<Option<SamlInbound>> {
    if ctx.method == HttpMethod::Post {
        if let Some(body) = ctx.body.as_deref().filter(|b| b.trim_start().starts_with('<')) {
            let xml = extract_soap_body(body)?;
            let message = parse_message(&xml)?;
            return Ok(Some(SamlInbound {
                message,
                xml,
                binding: SamlBinding::Soap,
                relay_state: None,
                redirect_signature: None,
            }));
        }

        for param in [SAML_RESPONSE, SAML_REQUEST] {
            if let Some(encoded) = ctx.form_param(param) {
                let xml = decode_post(encoded)?;
                let message = parse_message(&xml)?;
                return Ok(Some(SamlInbound {
                    message,
                    xml,
                    binding: SamlBinding::Post,
                    relay_state: ctx.form_param(RELAY_STATE).map(String::from),
                    redirect_signature: None,
                }));
            }
        }
        return Ok(None);
    }

    let Some(query) = ctx.query_string.as_deref() else {
        return Ok(None);
    };
    let query = RedirectQuery::parse(query)?;

    let (param, encoded) = match (query.value(SAML_RESPONSE), query.value(SAML_REQUEST)) {
        (Some(_), Some(_)) => {
            return Err(AuthError::InvalidMessage(
                "query carries both SAMLRequest and SAMLResponse".to_string(),
            ))
        }
        (Some(response), None) => (SAML_RESPONSE, response),
        (None, Some(request)) => (SAML_REQUEST, request),
        (None, None) => return Ok(None),
    };

    let xml = inflate_redirect(encoded)?;
    let message = parse_message(&xml)?;

    let redirect_signature = match (query.value(SIG_ALG), query.value(SIGNATURE)) {
        (Some(sig_alg), Some(signature)) => {
            let signed_content = query.signed_content(param).ok_or_else(|| {
                AuthError::InvalidMessage("cannot rebuild signed redirect query".to_string())
            })?;
            Some(RedirectSignature {
                sig_alg: sig_alg.to_string(),
                signature: signature.to_string(),
                signed_content,
            })
        }
        (None, None) => None,
        _ => {
            return Err(AuthError::InvalidMessage(
                "SigAlg and Signature must be sent together".to_string(),
            ))
        }
    };

    Ok(Some(SamlInbound {
        message,
        xml,
        binding: SamlBinding::Redirect,
        relay_state: query.value(RELAY_STATE).map(String::from),
        redirect_signature,
    }))
}
