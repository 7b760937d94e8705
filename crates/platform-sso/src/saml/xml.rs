//! Minimal XML tree over quick-xml.
//!
//! SAML messages are small and are inspected in several passes (status,
//! conditions, signatures), so they are read once into an element tree. Each
//! element keeps the byte span it occupies in the source document; signature
//! verification needs the exact original text of the signed element.
//!
//! DOCTYPE declarations are refused outright.

use crate::error::{AuthError, AuthResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashSet;
use std::ops::Range;

/// Deepest nesting accepted. SAML responses stay well below this.
const MAX_DEPTH: usize = 64;

/// One parsed element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    /// Local name (namespace prefix stripped)
    pub name: String,

    /// Attributes by local name, in document order
    pub attributes: Vec<(String, String)>,

    /// Child elements
    pub children: Vec<XmlElement>,

    /// Concatenated character data directly inside this element
    pub text: String,

    /// Byte range of the element in the source document
    pub span: Range<usize>,
}

impl XmlElement {
    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> AuthResult<XmlElement> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;
        let mut buf = Vec::new();

        loop {
            let before = reader.buffer_position() as usize;
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| AuthError::InvalidMessage(format!("XML parse error: {}", e)))?;
            let after = reader.buffer_position() as usize;
            let start = tag_start(xml, before, after);

            match event {
                Event::DocType(_) => {
                    return Err(AuthError::InvalidMessage(
                        "DOCTYPE is not allowed in SAML messages".to_string(),
                    ));
                }
                Event::Start(ref e) => {
                    if stack.len() >= MAX_DEPTH {
                        return Err(AuthError::InvalidMessage(
                            "XML nesting too deep".to_string(),
                        ));
                    }
                    stack.push(Self::open(e, start..start)?);
                }
                Event::Empty(ref e) => {
                    let element = Self::open(e, start..after)?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let mut element = stack.pop().ok_or_else(|| {
                        AuthError::InvalidMessage("unbalanced XML end tag".to_string())
                    })?;
                    element.span.end = after;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::Text(ref e) => {
                    if let Some(current) = stack.last_mut() {
                        let text = e.unescape().map_err(|err| {
                            AuthError::InvalidMessage(format!("invalid XML text: {}", err))
                        })?;
                        current.text.push_str(&text);
                    }
                }
                Event::CData(ref e) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&e[..]));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(AuthError::InvalidMessage(
                "unterminated XML element".to_string(),
            ));
        }

        root.ok_or_else(|| AuthError::InvalidMessage("empty XML document".to_string()))
    }

    fn open(e: &BytesStart<'_>, span: Range<usize>) -> AuthResult<XmlElement> {
        let name = String::from_utf8_lossy(e.local_name().into_inner()).to_string();

        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr
                .map_err(|err| AuthError::InvalidMessage(format!("invalid XML attribute: {}", err)))?;
            let key = String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
            if key == "xmlns" || attr.key.as_ref().starts_with(b"xmlns:") {
                continue;
            }
            let value = attr
                .unescape_value()
                .map_err(|err| AuthError::InvalidMessage(format!("invalid XML attribute: {}", err)))?;
            attributes.push((key, value.to_string()));
        }

        Ok(XmlElement {
            name,
            attributes,
            children: Vec::new(),
            text: String::new(),
            span,
        })
    }

    fn attach(
        stack: &mut [XmlElement],
        root: &mut Option<XmlElement>,
        element: XmlElement,
    ) -> AuthResult<()> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if root.is_none() => *root = Some(element),
            None => {
                return Err(AuthError::InvalidMessage(
                    "XML document has more than one root element".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Attribute value by local name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First child with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a path of child names.
    pub fn path(&self, names: &[&str]) -> Option<&XmlElement> {
        names
            .iter()
            .try_fold(self, |element, name| element.child(name))
    }

    /// Trimmed text content.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// Text of the named child, when present and non-empty.
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(|c| c.text().to_string())
            .filter(|t| !t.is_empty())
    }

    /// First `ID`/`Id`/`id` attribute value carried by more than one element
    /// in this subtree.
    pub fn duplicate_id(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        let mut pending = vec![self];
        while let Some(element) = pending.pop() {
            for (key, value) in &element.attributes {
                if matches!(key.as_str(), "ID" | "Id" | "id") && !seen.insert(value.as_str()) {
                    return Some(value.as_str());
                }
            }
            pending.extend(element.children.iter());
        }
        None
    }

    /// Original source text of this element.
    pub fn source<'a>(&self, document: &'a str) -> &'a str {
        document.get(self.span.clone()).unwrap_or_default()
    }
}

/// Position of the `<` that opened the event read between `before` and
/// `after`; skipped whitespace is not part of the element.
fn tag_start(xml: &str, before: usize, after: usize) -> usize {
    if let Some(offset) = xml.get(before..after).and_then(|slice| slice.find('<')) {
        return before + offset;
    }
    // The reader may already have consumed the '<' while reading text
    if before > 0 && xml.as_bytes().get(before - 1) == Some(&b'<') {
        return before - 1;
    }
    before
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r1">
    <saml:Issuer xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">https://idp.example.com</saml:Issuer>
    <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
    <Note><![CDATA[a < b]]> &amp; c</Note>
</samlp:Response>"#;

    #[test]
    fn test_tree_and_lookup() {
        let root = XmlElement::parse(DOC).unwrap();

        assert_eq!(root.name, "Response");
        assert_eq!(root.attr("ID"), Some("_r1"));
        assert!(root.attr("samlp").is_none());
        assert_eq!(
            root.child_text("Issuer").as_deref(),
            Some("https://idp.example.com")
        );
        assert_eq!(
            root.path(&["Status", "StatusCode"])
                .and_then(|e| e.attr("Value")),
            Some("urn:oasis:names:tc:SAML:2.0:status:Success")
        );
        assert_eq!(root.child("Note").unwrap().text(), "a < b& c");
    }

    #[test]
    fn test_source_spans() {
        let root = XmlElement::parse(DOC).unwrap();

        let issuer = root.child("Issuer").unwrap();
        assert!(issuer.source(DOC).starts_with("<saml:Issuer"));
        assert!(issuer.source(DOC).ends_with("</saml:Issuer>"));

        let status_code = root.path(&["Status", "StatusCode"]).unwrap();
        assert!(status_code.source(DOC).starts_with("<samlp:StatusCode"));
        assert!(status_code.source(DOC).ends_with("/>"));

        assert!(root.source(DOC).starts_with("<samlp:Response"));
        assert!(root.source(DOC).ends_with("</samlp:Response>"));
    }

    #[test]
    fn test_duplicate_id() {
        assert_eq!(XmlElement::parse(DOC).unwrap().duplicate_id(), None);

        let wrapped = r#"<Response ID="_r1"><Extensions><Assertion ID="_a1"/></Extensions><Assertion ID="_a1"/></Response>"#;
        assert_eq!(XmlElement::parse(wrapped).unwrap().duplicate_id(), Some("_a1"));

        let mixed_case = r#"<Response ID="_r1"><Object Id="_r1"/></Response>"#;
        assert_eq!(XmlElement::parse(mixed_case).unwrap().duplicate_id(), Some("_r1"));
    }

    #[test]
    fn test_doctype_rejected() {
        let xml = r#"<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]><foo>&xxe;</foo>"#;
        assert!(XmlElement::parse(xml).is_err());
    }

    #[test]
    fn test_malformed_documents() {
        assert!(XmlElement::parse("").is_err());
        assert!(XmlElement::parse("<a><b></a>").is_err());
        assert!(XmlElement::parse("<a/><b/>").is_err());
    }
}
