use super::Namespaces;
use super::fault::Fault;
use super::xml::{Element, XmlError};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// A typed operation result read out of an envelope body.
///
/// Implementations read the fields they know from the body's payload element
/// and ignore anything else, so newer peers adding elements do not break
/// older clients.
pub trait Response: Sized {
    fn from_element(element: &Element) -> Result<Self, String>;

    /// Value for an empty body. `None` (the default) makes an empty body a
    /// decode error; void operations return `Some`.
    fn from_empty() -> Option<Self> {
        None
    }
}

/// Void result: accepts an empty body or a payload element of any content.
impl Response for () {
    fn from_element(_: &Element) -> Result<Self, String> {
        Ok(())
    }

    fn from_empty() -> Option<Self> {
        Some(())
    }
}

/// One SOAP 1.2 envelope: an optional header and at most one body payload.
///
/// ```text
/// <env:Envelope xmlns:env=... xmlns:tev=...>
///   <env:Header><wsse:Security>...</wsse:Security></env:Header>
///   <env:Body><tev:PullMessages>...</tev:PullMessages></env:Body>
/// </env:Envelope>
/// ```
///
/// The payload is either an operation element or an `env:Fault`, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Header blocks (children of `env:Header`).
    pub header: Vec<Element>,
    /// The single child of `env:Body`, if any.
    pub body: Option<Element>,
}

/// Why an envelope could not be turned into the expected result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The body carried a fault.
    Fault(Fault),
    /// The document was not an envelope or the payload had the wrong shape.
    Malformed(String),
}

impl Envelope {
    pub fn new(body: Element) -> Self {
        Envelope {
            header: Vec::new(),
            body: Some(body),
        }
    }

    /// Envelope with an empty body (void operation responses).
    pub fn empty() -> Self {
        Envelope::default()
    }

    pub fn for_fault(fault: &Fault) -> Self {
        Envelope::new(fault.to_element())
    }

    pub fn with_header(mut self, block: Element) -> Self {
        self.header.push(block);
        self
    }

    /// Header block with the given local name (e.g. `Security`).
    pub fn header_block(&self, local_name: &str) -> Option<&Element> {
        self.header.iter().find(|h| h.local_name() == local_name)
    }

    /// Serialize to wire bytes, declaring every configured namespace prefix
    /// on the envelope element. The `env:Header` element is written only when
    /// header blocks are present.
    pub fn encode(&self, namespaces: &Namespaces) -> Vec<u8> {
        let mut root = Element::new("env:Envelope");
        for (prefix, uri) in namespaces.bindings() {
            root = root.with_attr(format!("xmlns:{prefix}"), uri);
        }

        if !self.header.is_empty() {
            let mut header = Element::new("env:Header");
            header.children = self.header.clone();
            root.push(header);
        }

        let mut body = Element::new("env:Body");
        if let Some(payload) = &self.body {
            body.push(payload.clone());
        }
        root.push(body);

        let mut out = String::from(XML_DECLARATION);
        out.push_str(&root.to_xml());
        out.into_bytes()
    }

    /// Parse wire bytes into an envelope.
    ///
    /// Fails if the root is not an `Envelope`, the `Body` is missing, or the
    /// body carries more than one payload element.
    pub fn parse(bytes: &[u8]) -> Result<Self, XmlError> {
        let root = Element::parse(bytes)?;
        if root.local_name() != "Envelope" {
            return Err(XmlError(format!(
                "expected Envelope root, found {}",
                root.name
            )));
        }

        let header = root
            .child("Header")
            .map(|h| h.children.clone())
            .unwrap_or_default();

        let body = root
            .child("Body")
            .ok_or_else(|| XmlError("envelope has no Body".to_string()))?;

        let payload = match body.children.as_slice() {
            [] => None,
            [payload] => Some(payload.clone()),
            _ => {
                return Err(XmlError(format!(
                    "Body carries {} payload elements, expected one",
                    body.children.len()
                )));
            }
        };

        Ok(Envelope {
            header,
            body: payload,
        })
    }

    /// The fault in the body, if the payload is one.
    pub fn fault(&self) -> Option<Fault> {
        self.body
            .as_ref()
            .filter(|b| b.local_name() == "Fault")
            .map(Fault::from_element)
    }

    /// Interpret the body as `R`, surfacing faults separately from shape
    /// mismatches.
    pub fn into_result<R: Response>(self) -> Result<R, DecodeError> {
        if let Some(fault) = self.fault() {
            return Err(DecodeError::Fault(fault));
        }
        match &self.body {
            Some(payload) => R::from_element(payload).map_err(DecodeError::Malformed),
            None => R::from_empty()
                .ok_or_else(|| DecodeError::Malformed("empty Body".to_string())),
        }
    }
}

/// Parse response bytes and decode them into `R`.
pub fn decode<R: Response>(bytes: &[u8]) -> Result<R, DecodeError> {
    Envelope::parse(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?
        .into_result()
}

/// [`decode`] for the reply to `operation`: a result payload must be the
/// `{operation}Response` element.
pub fn decode_response<R: Response>(bytes: &[u8], operation: &str) -> Result<R, DecodeError> {
    let envelope = Envelope::parse(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if envelope.fault().is_none() {
        if let Some(payload) = &envelope.body {
            let expected = format!("{operation}Response");
            if payload.local_name() != expected {
                return Err(DecodeError::Malformed(format!(
                    "expected {expected}, got {}",
                    payload.local_name()
                )));
            }
        }
    }
    envelope.into_result()
}

/// Extract a fault from a response body, if it is a well-formed fault envelope.
///
/// Used to classify non-2xx HTTP responses: SOAP 1.2 peers commonly send
/// faults with status 400 or 500.
pub fn parse_fault(bytes: &[u8]) -> Option<Fault> {
    Envelope::parse(bytes).ok()?.fault()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Echo {
        value: String,
    }

    impl Response for Echo {
        fn from_element(element: &Element) -> Result<Self, String> {
            let value = element
                .child_text("Value")
                .ok_or("EchoResponse has no Value")?
                .to_string();
            Ok(Echo { value })
        }
    }

    fn wrap(body: &str) -> Vec<u8> {
        format!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body>{body}</s:Body></s:Envelope>"#
        )
        .into_bytes()
    }

    #[test]
    fn encode_declares_namespaces_and_omits_empty_header() {
        let env = Envelope::new(Element::new("tev:Echo"));
        let xml = String::from_utf8(env.encode(&Namespaces::default())).unwrap();
        assert!(xml.starts_with(XML_DECLARATION));
        assert!(xml.contains(r#"xmlns:env="http://www.w3.org/2003/05/soap-envelope""#));
        assert!(xml.contains(r#"xmlns:tev="http://www.onvif.org/ver10/events/wsdl""#));
        assert!(!xml.contains("env:Header"));
        assert!(xml.contains("<env:Body><tev:Echo/></env:Body>"));
    }

    #[test]
    fn encode_attaches_header_when_supplied() {
        let env = Envelope::new(Element::new("tev:Echo")).with_header(Element::new("wsse:Security"));
        let xml = String::from_utf8(env.encode(&Namespaces::default())).unwrap();
        assert!(xml.contains("<env:Header><wsse:Security/></env:Header>"));

        let parsed = Envelope::parse(xml.as_bytes()).unwrap();
        assert!(parsed.header_block("Security").is_some());
        assert_eq!(parsed.body.unwrap().local_name(), "Echo");
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let bytes = wrap("<t:EchoResponse><t:Extra>1</t:Extra><t:Value>hi</t:Value></t:EchoResponse>");
        assert_eq!(
            decode::<Echo>(&bytes).unwrap(),
            Echo {
                value: "hi".to_string()
            }
        );
    }

    #[test]
    fn decode_fault_is_classified() {
        let bytes = wrap(
            "<s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code>\
             <s:Reason><s:Text>busy</s:Text></s:Reason></s:Fault>",
        );
        match decode::<Echo>(&bytes) {
            Err(DecodeError::Fault(fault)) => {
                assert_eq!(fault.code(), "s:Receiver");
                assert_eq!(fault.reason(), "busy");
            }
            other => panic!("expected fault, got {other:?}"),
        }
        assert!(parse_fault(&bytes).is_some());
    }

    #[test]
    fn reply_must_be_named_after_operation() {
        let bytes = wrap("<t:EchoResponse><t:Value>hi</t:Value></t:EchoResponse>");
        assert!(decode_response::<Echo>(&bytes, "Echo").is_ok());
        assert!(matches!(
            decode_response::<Echo>(&bytes, "Ping"),
            Err(DecodeError::Malformed(reason)) if reason.contains("expected PingResponse")
        ));
        assert!(matches!(
            decode_response::<()>(&wrap("<t:Unrelated/>"), "Unsubscribe"),
            Err(DecodeError::Malformed(_))
        ));
        assert_eq!(decode_response::<()>(&wrap(""), "Unsubscribe"), Ok(()));

        let fault = wrap(
            "<s:Fault><s:Code><s:Value>s:Sender</s:Value></s:Code>\
             <s:Reason><s:Text>no</s:Text></s:Reason></s:Fault>",
        );
        assert!(matches!(
            decode_response::<Echo>(&fault, "Echo"),
            Err(DecodeError::Fault(_))
        ));
    }

    #[test]
    fn empty_body_only_valid_for_void() {
        let bytes = wrap("");
        assert_eq!(decode::<()>(&bytes), Ok(()));
        assert!(matches!(
            decode::<Echo>(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn shape_mismatch_is_malformed() {
        let bytes = wrap("<t:EchoResponse/>");
        assert!(matches!(
            decode::<Echo>(&bytes),
            Err(DecodeError::Malformed(reason)) if reason.contains("no Value")
        ));
        assert!(matches!(
            decode::<Echo>(b"<html>oops</html>"),
            Err(DecodeError::Malformed(_))
        ));
        assert_eq!(parse_fault(b"Internal Server Error"), None);
    }

    #[test]
    fn multiple_payloads_rejected() {
        let bytes = wrap("<a/><b/>");
        assert!(Envelope::parse(&bytes).is_err());
    }
}
