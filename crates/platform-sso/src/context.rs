//! Request and response abstractions.
//!
//! The engine does not depend on a web framework. Adapters translate the
//! inbound request into a [`RequestContext`] and turn the returned
//! [`RedirectInstruction`] / [`crate::logout::LogoutOutcome`] back into an
//! HTTP response.

use std::collections::HashMap;

/// HTTP method of the inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
}

/// Inbound request as seen by the engine.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method
    pub method: HttpMethod,

    /// Full request URL
    pub url: String,

    /// Raw (still percent-encoded) query string
    pub query_string: Option<String>,

    /// Current browser session identifier
    pub session_id: String,

    /// Raw request body, for SOAP bindings
    pub body: Option<String>,

    query: HashMap<String, String>,
    form: HashMap<String, String>,
    headers: HashMap<String, String>,
}

impl RequestContext {
    /// Create a GET request context.
    pub fn get(url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url, session_id)
    }

    /// Create a POST request context.
    pub fn post(url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url, session_id)
    }

    /// Create a request context, parsing query parameters from the URL.
    pub fn new(method: HttpMethod, url: impl Into<String>, session_id: impl Into<String>) -> Self {
        let url = url.into();
        let mut query = HashMap::new();
        let mut query_string = None;

        if let Ok(parsed) = url::Url::parse(&url) {
            query_string = parsed.query().map(String::from);
            for (key, value) in parsed.query_pairs() {
                query.entry(key.into_owned()).or_insert(value.into_owned());
            }
        }

        Self {
            method,
            url,
            query_string,
            session_id: session_id.into(),
            body: None,
            query,
            form: HashMap::new(),
            headers: HashMap::new(),
        }
    }

    /// Add a form parameter (application/x-www-form-urlencoded body).
    pub fn with_form_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.insert(name.into(), value.into());
        self
    }

    /// Add a header. Names are case-insensitive.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the raw body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Query parameter by name.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Form parameter by name.
    pub fn form_param(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// Parameter from the query string or, failing that, the form body.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.query_param(name).or_else(|| self.form_param(name))
    }

    /// Header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// True when the parameter is present and non-blank.
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameter(name).is_some_and(|v| !v.trim().is_empty())
    }
}

/// Where to send the browser next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectInstruction {
    /// HTTP 302 to the URL
    Location(String),

    /// Auto-submitting HTML form (SAML HTTP-POST binding)
    FormPost {
        /// Form action URL
        action: String,
        /// Hidden fields, in order
        fields: Vec<(String, String)>,
    },
}

impl RedirectInstruction {
    /// Redirect URL, for `Location` instructions.
    pub fn location(&self) -> Option<&str> {
        match self {
            RedirectInstruction::Location(url) => Some(url),
            RedirectInstruction::FormPost { .. } => None,
        }
    }

    /// Render an auto-submitting HTML page for `FormPost` instructions.
    pub fn to_html(&self) -> Option<String> {
        let RedirectInstruction::FormPost { action, fields } = self else {
            return None;
        };

        let inputs: String = fields
            .iter()
            .map(|(name, value)| {
                format!(
                    "<input type=\"hidden\" name=\"{}\" value=\"{}\"/>",
                    quick_xml::escape::escape(name.as_str()),
                    quick_xml::escape::escape(value.as_str())
                )
            })
            .collect();

        Some(format!(
            "<!DOCTYPE html><html><body onload=\"document.forms[0].submit()\">\
             <form method=\"post\" action=\"{}\">{}\
             <noscript><input type=\"submit\" value=\"Continue\"/></noscript>\
             </form></body></html>",
            quick_xml::escape::escape(action.as_str()),
            inputs
        ))
    }
}

/// Append query parameters to a URL that may already carry a query string.
pub(crate) fn append_query<K, V>(base: &str, params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if params.is_empty() {
        return base.to_string();
    }

    let encoded: String = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();

    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, separator, encoded)
}
