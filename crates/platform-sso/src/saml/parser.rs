//! SAML2 message parsing.
//!
//! Turns the element tree into the message model. Structural problems
//! (missing ID, unparseable instants, unknown root) are `InvalidMessage`;
//! semantic checks belong to the validators.

use crate::error::{AuthError, AuthResult};
use crate::saml::model::{
    Assertion, AuthnStatement, Conditions, EncryptedElement, LogoutRequest, LogoutResponse,
    NameId, SamlAttribute, SamlMessage, SamlResponse, Status, Subject, SubjectConfirmation,
    SubjectConfirmationData, XmlSignature,
};
use crate::saml::xml::XmlElement;
use chrono::{DateTime, Utc};

/// Parse an inbound protocol message.
pub fn parse_message(xml: &str) -> AuthResult<SamlMessage> {
    let root = XmlElement::parse(xml)?;
    unique_ids(&root)?;

    match root.name.as_str() {
        "Response" => parse_response(&root, xml).map(SamlMessage::Response),
        "LogoutRequest" => parse_logout_request(&root, xml).map(SamlMessage::LogoutRequest),
        "LogoutResponse" => parse_logout_response(&root).map(SamlMessage::LogoutResponse),
        other => Err(AuthError::InvalidMessage(format!(
            "unexpected SAML message <{}>",
            other
        ))),
    }
}

/// Parse a standalone assertion, such as the plaintext of an `EncryptedAssertion`.
pub fn parse_assertion(xml: &str) -> AuthResult<Assertion> {
    let root = XmlElement::parse(xml)?;
    if root.name != "Assertion" {
        return Err(AuthError::InvalidMessage(format!(
            "expected <Assertion>, found <{}>",
            root.name
        )));
    }
    unique_ids(&root)?;
    assertion(&root, xml)
}

/// Signature references resolve by ID, so an ID value may appear only once.
fn unique_ids(root: &XmlElement) -> AuthResult<()> {
    match root.duplicate_id() {
        Some(id) => Err(AuthError::InvalidMessage(format!(
            "ID {} appears more than once in the document",
            id
        ))),
        None => Ok(()),
    }
}

/// Parse a standalone `Attribute` (decrypted `EncryptedAttribute`).
pub fn parse_attribute(xml: &str) -> AuthResult<SamlAttribute> {
    let root = XmlElement::parse(xml)?;
    if root.name != "Attribute" {
        return Err(AuthError::InvalidMessage(format!(
            "expected <Attribute>, found <{}>",
            root.name
        )));
    }
    attribute(&root)
}

/// Parse a standalone `NameID` (decrypted `EncryptedID`).
pub fn parse_name_id(xml: &str) -> AuthResult<NameId> {
    let root = XmlElement::parse(xml)?;
    if root.name != "NameID" {
        return Err(AuthError::InvalidMessage(format!(
            "expected <NameID>, found <{}>",
            root.name
        )));
    }
    Ok(name_id(&root))
}

fn parse_response(root: &XmlElement, xml: &str) -> AuthResult<SamlResponse> {
    let status = root
        .child("Status")
        .map(status)
        .ok_or_else(|| AuthError::InvalidMessage("Response has no Status".to_string()))?;

    let assertions = root
        .children_named("Assertion")
        .map(|a| assertion(a, xml))
        .collect::<AuthResult<Vec<_>>>()?;

    let encrypted_assertions = root
        .children_named("EncryptedAssertion")
        .map(|e| encrypted(e, xml))
        .collect();

    Ok(SamlResponse {
        id: required_attr(root, "ID")?,
        in_response_to: root.attr("InResponseTo").map(String::from),
        issue_instant: required_instant(root, "IssueInstant")?,
        destination: root.attr("Destination").map(String::from),
        issuer: root.child_text("Issuer"),
        status,
        signature: signature(root)?,
        assertions,
        encrypted_assertions,
    })
}

fn parse_logout_request(root: &XmlElement, xml: &str) -> AuthResult<LogoutRequest> {
    Ok(LogoutRequest {
        id: required_attr(root, "ID")?,
        issue_instant: required_instant(root, "IssueInstant")?,
        destination: root.attr("Destination").map(String::from),
        issuer: root.child_text("Issuer"),
        not_on_or_after: optional_instant(root, "NotOnOrAfter")?,
        reason: root.attr("Reason").map(String::from),
        name_id: root.child("NameID").map(name_id),
        encrypted_id: root.child("EncryptedID").map(|e| encrypted(e, xml)),
        session_indexes: root
            .children_named("SessionIndex")
            .map(|s| s.text().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        signature: signature(root)?,
    })
}

fn parse_logout_response(root: &XmlElement) -> AuthResult<LogoutResponse> {
    let status = root
        .child("Status")
        .map(status)
        .ok_or_else(|| AuthError::InvalidMessage("LogoutResponse has no Status".to_string()))?;

    Ok(LogoutResponse {
        id: required_attr(root, "ID")?,
        in_response_to: root.attr("InResponseTo").map(String::from),
        issue_instant: required_instant(root, "IssueInstant")?,
        destination: root.attr("Destination").map(String::from),
        issuer: root.child_text("Issuer"),
        status,
        signature: signature(root)?,
    })
}

fn assertion(element: &XmlElement, xml: &str) -> AuthResult<Assertion> {
    let subject = element
        .child("Subject")
        .map(|s| subject(s, xml))
        .transpose()?;
    let conditions = element.child("Conditions").map(conditions).transpose()?;

    let authn_statements = element
        .children_named("AuthnStatement")
        .map(authn_statement)
        .collect::<AuthResult<Vec<_>>>()?;

    let mut attributes = Vec::new();
    let mut encrypted_attributes = Vec::new();
    for statement in element.children_named("AttributeStatement") {
        for attr in statement.children_named("Attribute") {
            attributes.push(attribute(attr)?);
        }
        for enc in statement.children_named("EncryptedAttribute") {
            encrypted_attributes.push(encrypted(enc, xml));
        }
    }

    Ok(Assertion {
        id: required_attr(element, "ID")?,
        issuer: element.child_text("Issuer"),
        issue_instant: optional_instant(element, "IssueInstant")?,
        signature: signature(element)?,
        subject,
        conditions,
        authn_statements,
        attributes,
        encrypted_attributes,
        document: xml.to_string(),
    })
}

fn subject(element: &XmlElement, xml: &str) -> AuthResult<Subject> {
    let confirmations = element
        .children_named("SubjectConfirmation")
        .map(|c| {
            let data = c
                .child("SubjectConfirmationData")
                .map(|d| -> AuthResult<SubjectConfirmationData> {
                    Ok(SubjectConfirmationData {
                        recipient: d.attr("Recipient").map(String::from),
                        not_before: optional_instant(d, "NotBefore")?,
                        not_on_or_after: optional_instant(d, "NotOnOrAfter")?,
                        in_response_to: d.attr("InResponseTo").map(String::from),
                        address: d.attr("Address").map(String::from),
                    })
                })
                .transpose()?;
            Ok(SubjectConfirmation {
                method: c.attr("Method").unwrap_or_default().to_string(),
                data,
            })
        })
        .collect::<AuthResult<Vec<_>>>()?;

    Ok(Subject {
        name_id: element.child("NameID").map(name_id),
        encrypted_id: element.child("EncryptedID").map(|e| encrypted(e, xml)),
        confirmations,
    })
}

fn conditions(element: &XmlElement) -> AuthResult<Conditions> {
    Ok(Conditions {
        not_before: optional_instant(element, "NotBefore")?,
        not_on_or_after: optional_instant(element, "NotOnOrAfter")?,
        audience_restrictions: element
            .children_named("AudienceRestriction")
            .map(|r| {
                r.children_named("Audience")
                    .map(|a| a.text().to_string())
                    .collect()
            })
            .collect(),
        one_time_use: element.child("OneTimeUse").is_some(),
    })
}

fn authn_statement(element: &XmlElement) -> AuthResult<AuthnStatement> {
    let class_refs = element
        .child("AuthnContext")
        .map(|ctx| {
            ctx.children_named("AuthnContextClassRef")
                .map(|c| c.text().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(AuthnStatement {
        authn_instant: optional_instant(element, "AuthnInstant")?,
        session_index: element.attr("SessionIndex").map(String::from),
        session_not_on_or_after: optional_instant(element, "SessionNotOnOrAfter")?,
        class_refs,
    })
}

fn attribute(element: &XmlElement) -> AuthResult<SamlAttribute> {
    Ok(SamlAttribute {
        name: required_attr(element, "Name")?,
        friendly_name: element.attr("FriendlyName").map(String::from),
        name_format: element.attr("NameFormat").map(String::from),
        values: element
            .children_named("AttributeValue")
            .map(|v| v.text().to_string())
            .collect(),
    })
}

fn name_id(element: &XmlElement) -> NameId {
    NameId {
        value: element.text().to_string(),
        format: element.attr("Format").map(String::from),
        name_qualifier: element.attr("NameQualifier").map(String::from),
        sp_name_qualifier: element.attr("SPNameQualifier").map(String::from),
    }
}

fn status(element: &XmlElement) -> Status {
    let code = element.child("StatusCode");
    Status {
        code: code
            .and_then(|c| c.attr("Value"))
            .unwrap_or_default()
            .to_string(),
        sub_code: code
            .and_then(|c| c.child("StatusCode"))
            .and_then(|c| c.attr("Value"))
            .map(String::from),
        message: element.child_text("StatusMessage"),
    }
}

fn signature(element: &XmlElement) -> AuthResult<Option<XmlSignature>> {
    let Some(sig) = element.child("Signature") else {
        return Ok(None);
    };

    let signature_value: String = sig
        .child("SignatureValue")
        .map(|v| v.text().split_whitespace().collect())
        .unwrap_or_default();
    if signature_value.is_empty() {
        return Err(AuthError::InvalidMessage(
            "Signature has no SignatureValue".to_string(),
        ));
    }

    let certificates = sig
        .path(&["KeyInfo", "X509Data"])
        .map(|data| {
            data.children_named("X509Certificate")
                .map(|c| c.text().split_whitespace().collect::<String>())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(XmlSignature {
        reference_uri: sig
            .path(&["SignedInfo", "Reference"])
            .and_then(|r| r.attr("URI"))
            .map(String::from),
        signature_method: sig
            .path(&["SignedInfo", "SignatureMethod"])
            .and_then(|m| m.attr("Algorithm"))
            .map(String::from),
        signature_value,
        certificates,
    }))
}

fn encrypted(element: &XmlElement, xml: &str) -> EncryptedElement {
    EncryptedElement {
        xml: element.source(xml).to_string(),
    }
}

fn required_attr(element: &XmlElement, name: &str) -> AuthResult<String> {
    element
        .attr(name)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            AuthError::InvalidMessage(format!("<{}> has no {} attribute", element.name, name))
        })
}

fn optional_instant(element: &XmlElement, name: &str) -> AuthResult<Option<DateTime<Utc>>> {
    element.attr(name).map(parse_instant).transpose()
}

fn required_instant(element: &XmlElement, name: &str) -> AuthResult<DateTime<Utc>> {
    optional_instant(element, name)?.ok_or_else(|| {
        AuthError::InvalidMessage(format!("<{}> has no {} attribute", element.name, name))
    })
}

/// Parse an `xs:dateTime` as used by SAML (UTC, optional fraction).
pub fn parse_instant(value: &str) -> AuthResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuthError::InvalidMessage(format!("invalid instant '{}': {}", value, e)))
}
