//! CAS `serviceResponse` and single logout message parsing.

use crate::error::{AuthError, AuthResult};
use crate::saml::xml::XmlElement;
use serde_json::Value;
use std::collections::HashMap;

/// Successful ticket validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CasAssertion {
    /// `cas:user`
    pub user: String,

    /// `cas:attributes`; repeated names become arrays
    pub attributes: HashMap<String, Value>,

    /// `cas:proxyGrantingTicket` IOU, when requested
    pub proxy_granting_ticket: Option<String>,
}

/// Parse a `serviceValidate` response body.
///
/// `authenticationFailure` becomes [`AuthError::Protocol`] with the CAS
/// failure code.
pub fn parse_service_response(xml: &str) -> AuthResult<CasAssertion> {
    let root = XmlElement::parse(xml)?;
    if root.name != "serviceResponse" {
        return Err(AuthError::InvalidMessage(format!(
            "expected cas:serviceResponse, found <{}>",
            root.name
        )));
    }

    if let Some(failure) = root.child("authenticationFailure") {
        let description = failure.text();
        return Err(AuthError::protocol(
            failure.attr("code").unwrap_or("UNKNOWN"),
            (!description.is_empty()).then(|| description.to_string()),
        ));
    }

    let success = root.child("authenticationSuccess").ok_or_else(|| {
        AuthError::InvalidMessage("serviceResponse has neither success nor failure".to_string())
    })?;

    let user = success
        .child_text("user")
        .ok_or_else(|| AuthError::InvalidMessage("authenticationSuccess has no user".to_string()))?;

    let mut attributes: HashMap<String, Value> = HashMap::new();
    if let Some(list) = success.child("attributes") {
        for attribute in &list.children {
            let value = Value::String(attribute.text().to_string());
            match attributes.remove(&attribute.name) {
                None => {
                    attributes.insert(attribute.name.clone(), value);
                }
                Some(Value::Array(mut values)) => {
                    values.push(value);
                    attributes.insert(attribute.name.clone(), Value::Array(values));
                }
                Some(previous) => {
                    attributes.insert(attribute.name.clone(), Value::Array(vec![previous, value]));
                }
            }
        }
    }

    Ok(CasAssertion {
        user,
        attributes,
        proxy_granting_ticket: success.child_text("proxyGrantingTicket"),
    })
}

/// Service ticket named by a CAS single logout request.
pub fn parse_logout_request(xml: &str) -> AuthResult<String> {
    let root = XmlElement::parse(xml)?;
    if root.name != "LogoutRequest" {
        return Err(AuthError::InvalidMessage(format!(
            "expected LogoutRequest, found <{}>",
            root.name
        )));
    }
    root.child_text("SessionIndex")
        .ok_or_else(|| AuthError::InvalidMessage("CAS logout request has no SessionIndex".to_string()))
}
