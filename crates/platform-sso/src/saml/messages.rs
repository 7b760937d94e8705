//! Outbound SAML2 protocol messages.

use crate::saml::model::{NameId, Status};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;

const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";

fn instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn optional_attr(name: &str, value: Option<&str>) -> String {
    value
        .map(|v| format!(" {}=\"{}\"", name, escape(v)))
        .unwrap_or_default()
}

fn name_id_xml(name_id: &NameId) -> String {
    format!(
        "<saml:NameID{}{}{}>{}</saml:NameID>",
        optional_attr("Format", name_id.format.as_deref()),
        optional_attr("NameQualifier", name_id.name_qualifier.as_deref()),
        optional_attr("SPNameQualifier", name_id.sp_name_qualifier.as_deref()),
        escape(name_id.value.as_str())
    )
}

/// `AuthnRequest` content.
#[derive(Debug, Clone)]
pub struct AuthnRequestParams<'a> {
    /// Request ID
    pub id: &'a str,
    /// IdP SSO endpoint
    pub destination: &'a str,
    /// SP entity ID
    pub issuer: &'a str,
    /// ACS URL
    pub acs_url: &'a str,
    /// Binding the response should use
    pub protocol_binding: &'a str,
    /// `NameIDPolicy/@Format`
    pub name_id_format: Option<&'a str>,
    /// `ForceAuthn`
    pub force_authn: bool,
    /// `IsPassive`
    pub passive: bool,
    /// Requested context classes
    pub class_refs: &'a [String],
    /// `IssueInstant`
    pub issue_instant: DateTime<Utc>,
}

/// Serialize an `AuthnRequest`.
pub fn authn_request(params: &AuthnRequestParams<'_>) -> String {
    let mut xml = format!(
        "<samlp:AuthnRequest xmlns:samlp=\"{}\" xmlns:saml=\"{}\" ID=\"{}\" Version=\"2.0\" \
         IssueInstant=\"{}\" Destination=\"{}\" AssertionConsumerServiceURL=\"{}\" ProtocolBinding=\"{}\"",
        PROTOCOL_NS,
        ASSERTION_NS,
        escape(params.id),
        instant(params.issue_instant),
        escape(params.destination),
        escape(params.acs_url),
        escape(params.protocol_binding),
    );
    if params.force_authn {
        xml.push_str(" ForceAuthn=\"true\"");
    }
    if params.passive {
        xml.push_str(" IsPassive=\"true\"");
    }
    xml.push('>');

    xml.push_str(&format!("<saml:Issuer>{}</saml:Issuer>", escape(params.issuer)));
    xml.push_str(&format!(
        "<samlp:NameIDPolicy{} AllowCreate=\"true\"/>",
        optional_attr("Format", params.name_id_format)
    ));

    if !params.class_refs.is_empty() {
        xml.push_str("<samlp:RequestedAuthnContext Comparison=\"exact\">");
        for class_ref in params.class_refs {
            xml.push_str(&format!(
                "<saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef>",
                escape(class_ref.as_str())
            ));
        }
        xml.push_str("</samlp:RequestedAuthnContext>");
    }

    xml.push_str("</samlp:AuthnRequest>");
    xml
}

/// Serialize an SP-initiated `LogoutRequest`.
pub fn logout_request(
    id: &str,
    destination: &str,
    issuer: &str,
    name_id: &NameId,
    session_index: Option<&str>,
    issue_instant: DateTime<Utc>,
) -> String {
    let session = session_index
        .map(|s| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", escape(s)))
        .unwrap_or_default();

    format!(
        "<samlp:LogoutRequest xmlns:samlp=\"{}\" xmlns:saml=\"{}\" ID=\"{}\" Version=\"2.0\" \
         IssueInstant=\"{}\" Destination=\"{}\"><saml:Issuer>{}</saml:Issuer>{}{}</samlp:LogoutRequest>",
        PROTOCOL_NS,
        ASSERTION_NS,
        escape(id),
        instant(issue_instant),
        escape(destination),
        escape(issuer),
        name_id_xml(name_id),
        session
    )
}

/// Serialize a `LogoutResponse`.
pub fn logout_response(
    id: &str,
    in_response_to: &str,
    destination: Option<&str>,
    issuer: &str,
    status: &Status,
    issue_instant: DateTime<Utc>,
) -> String {
    format!(
        "<samlp:LogoutResponse xmlns:samlp=\"{}\" xmlns:saml=\"{}\" ID=\"{}\" Version=\"2.0\" \
         IssueInstant=\"{}\"{} InResponseTo=\"{}\"><saml:Issuer>{}</saml:Issuer>\
         <samlp:Status><samlp:StatusCode Value=\"{}\"/></samlp:Status></samlp:LogoutResponse>",
        PROTOCOL_NS,
        ASSERTION_NS,
        escape(id),
        instant(issue_instant),
        optional_attr("Destination", destination),
        escape(in_response_to),
        escape(issuer),
        escape(status.code.as_str())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::model::SamlMessage;
    use crate::saml::parser::parse_message;
    use crate::saml::xml::XmlElement;

    #[test]
    fn test_authn_request_shape() {
        let class_refs = vec!["urn:oasis:names:tc:SAML:2.0:ac:classes:Password".to_string()];
        let xml = authn_request(&AuthnRequestParams {
            id: "_req1",
            destination: "https://idp.example.com/sso",
            issuer: "https://sp.example.com",
            acs_url: "https://sp.example.com/acs?a=1&b=2",
            protocol_binding: "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
            name_id_format: None,
            force_authn: true,
            passive: false,
            class_refs: &class_refs,
            issue_instant: Utc::now(),
        });

        let root = XmlElement::parse(&xml).unwrap();
        assert_eq!(root.name, "AuthnRequest");
        assert_eq!(root.attr("ID"), Some("_req1"));
        assert_eq!(
            root.attr("AssertionConsumerServiceURL"),
            Some("https://sp.example.com/acs?a=1&b=2")
        );
        assert_eq!(root.attr("ForceAuthn"), Some("true"));
        assert!(root.attr("IsPassive").is_none());
        assert_eq!(
            root.child_text("Issuer").as_deref(),
            Some("https://sp.example.com")
        );
        assert!(root.path(&["RequestedAuthnContext", "AuthnContextClassRef"]).is_some());
    }

    #[test]
    fn test_logout_messages_parse_back() {
        let now = Utc::now();
        let request = logout_request(
            "_lr1",
            "https://idp.example.com/slo",
            "https://sp.example.com",
            &NameId::new("j<doe>"),
            Some("_s1"),
            now,
        );
        let SamlMessage::LogoutRequest(request) = parse_message(&request).unwrap() else {
            panic!("expected a LogoutRequest");
        };
        assert_eq!(request.name_id.unwrap().value, "j<doe>");
        assert_eq!(request.session_indexes, vec!["_s1".to_string()]);

        let response = logout_response(
            "_lo1",
            "_lr9",
            Some("https://idp.example.com/slo"),
            "https://sp.example.com",
            &Status::success(),
            now,
        );
        let SamlMessage::LogoutResponse(response) = parse_message(&response).unwrap() else {
            panic!("expected a LogoutResponse");
        };
        assert!(response.status.is_success());
        assert_eq!(response.in_response_to.as_deref(), Some("_lr9"));
    }
}
