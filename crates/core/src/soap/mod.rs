//! SOAP 1.2 envelope codec.
//!
//! Every RPC exchange is one envelope in each direction:
//!
//! ```text
//! POST /onvif/event_service HTTP/1.1
//! Content-Type: application/soap+xml; charset=utf-8; action="..."
//!
//! <env:Envelope ...>
//!   <env:Header>   (optional, carries wsse:Security)
//!   <env:Body>     (exactly one operation element or env:Fault)
//! </env:Envelope>
//! ```
//!
//! Successful responses are named `{Operation}Response`. Failures travel as
//! `env:Fault` inside an otherwise ordinary HTTP response and are decoded
//! into [`Fault`], never confused with transport errors.
//!
//! Element lookups match on local names, so peers are free to bind
//! whichever prefixes they like. Outgoing documents use the prefixes from
//! [`Namespaces::bindings`].

pub mod envelope;
pub mod fault;
pub mod xml;

pub use envelope::{DecodeError, Envelope, Response, decode, decode_response, parse_fault};
pub use fault::Fault;
pub use xml::{Element, XmlError};

/// Namespace URIs used when writing envelopes.
///
/// Passed to the codec as configuration rather than read from globals, so a
/// client can target peers that use other schema versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
    /// SOAP envelope (`env`).
    pub envelope: String,
    /// WS-Security extension (`wsse`).
    pub wsse: String,
    /// WS-Security utility (`wsu`).
    pub wsu: String,
    /// WS-Addressing (`wsa`).
    pub wsa: String,
    /// WS-BaseNotification (`wsnt`).
    pub wsnt: String,
    /// Event service WSDL (`tev`).
    pub events: String,
    /// Common schema (`tt`).
    pub schema: String,
    /// Error subcodes (`ter`).
    pub errors: String,
    /// Topic namespace root (`tns1`).
    pub topics: String,
}

impl Default for Namespaces {
    fn default() -> Self {
        Self {
            envelope: "http://www.w3.org/2003/05/soap-envelope".to_string(),
            wsse: "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"
                .to_string(),
            wsu: "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd"
                .to_string(),
            wsa: "http://www.w3.org/2005/08/addressing".to_string(),
            wsnt: "http://docs.oasis-open.org/wsn/b-2".to_string(),
            events: "http://www.onvif.org/ver10/events/wsdl".to_string(),
            schema: "http://www.onvif.org/ver10/schema".to_string(),
            errors: "http://www.onvif.org/ver10/error".to_string(),
            topics: "http://www.onvif.org/ver10/topics".to_string(),
        }
    }
}

impl Namespaces {
    /// `(prefix, uri)` pairs declared on every outgoing envelope.
    pub fn bindings(&self) -> [(&'static str, &str); 9] {
        [
            ("env", self.envelope.as_str()),
            ("wsse", self.wsse.as_str()),
            ("wsu", self.wsu.as_str()),
            ("wsa", self.wsa.as_str()),
            ("wsnt", self.wsnt.as_str()),
            ("tev", self.events.as_str()),
            ("tt", self.schema.as_str()),
            ("ter", self.errors.as_str()),
            ("tns1", self.topics.as_str()),
        ]
    }

    /// Namespace URI bound to `prefix`, if it is one of ours.
    pub fn uri(&self, prefix: &str) -> Option<&str> {
        self.bindings()
            .into_iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, uri)| uri)
    }
}
