use std::fmt;

use super::xml::Element;

/// A SOAP fault returned by the peer (SOAP 1.2 §5.4).
///
/// ```text
/// <env:Fault>
///   <env:Code>
///     <env:Value>env:Sender</env:Value>
///     <env:Subcode><env:Value>ter:NotAuthorized</env:Value></env:Subcode>
///   </env:Code>
///   <env:Reason><env:Text xml:lang="en">Sender not authorized</env:Text></env:Reason>
///   <env:Detail>...</env:Detail>
/// </env:Fault>
/// ```
///
/// Fields are read-only once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    code: String,
    subcode: Option<String>,
    reason: String,
    detail: Option<String>,
}

impl Fault {
    pub fn new(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Fault {
            code: code.into(),
            subcode: None,
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn with_subcode(mut self, subcode: impl Into<String>) -> Self {
        self.subcode = Some(subcode.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Fault category, e.g. `env:Sender` or `env:Receiver`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Most specific subcode, e.g. `ter:NotAuthorized`.
    pub fn subcode(&self) -> Option<&str> {
        self.subcode.as_deref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Whether the subcode's local part equals `local_name` (prefix-insensitive).
    pub fn is_subcode(&self, local_name: &str) -> bool {
        self.subcode
            .as_deref()
            .is_some_and(|s| s.rsplit(':').next() == Some(local_name))
    }

    /// Read a fault from an `env:Fault` element.
    ///
    /// Accepts both SOAP 1.2 (`Code/Value`, `Reason/Text`) and SOAP 1.1
    /// (`faultcode`, `faultstring`) layouts. For nested subcodes the
    /// innermost value is kept.
    pub fn from_element(fault: &Element) -> Self {
        let (code, subcode) = match fault.child("Code") {
            Some(code) => (
                code.child_text("Value").unwrap_or_default().to_string(),
                innermost_subcode(code),
            ),
            None => (
                fault.child_text("faultcode").unwrap_or_default().to_string(),
                None,
            ),
        };

        let reason = fault
            .path(&["Reason", "Text"])
            .map(Element::text)
            .or_else(|| fault.child_text("faultstring"))
            .unwrap_or_default()
            .to_string();

        let detail = fault
            .child("Detail")
            .or_else(|| fault.child("detail"))
            .map(describe_detail)
            .filter(|d| !d.is_empty());

        Fault {
            code,
            subcode,
            reason,
            detail,
        }
    }

    /// Build the SOAP 1.2 `env:Fault` element for this fault.
    pub fn to_element(&self) -> Element {
        let mut code = Element::new("env:Code").with_child(Element::new("env:Value").with_text(&self.code));
        if let Some(subcode) = &self.subcode {
            code.push(
                Element::new("env:Subcode")
                    .with_child(Element::new("env:Value").with_text(subcode)),
            );
        }

        let mut fault = Element::new("env:Fault").with_child(code).with_child(
            Element::new("env:Reason").with_child(
                Element::new("env:Text")
                    .with_attr("xml:lang", "en")
                    .with_text(&self.reason),
            ),
        );
        if let Some(detail) = &self.detail {
            fault.push(
                Element::new("env:Detail").with_child(Element::new("env:Text").with_text(detail)),
            );
        }
        fault
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(subcode) = &self.subcode {
            write!(f, "/{subcode}")?;
        }
        write!(f, ": {}", self.reason)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

fn innermost_subcode(code: &Element) -> Option<String> {
    let mut current = code.child("Subcode")?;
    while let Some(next) = current.child("Subcode") {
        current = next;
    }
    current.child_text("Value").map(str::to_string)
}

/// Flatten a `Detail` element to text: all descendant text, or the name of
/// the first child when the detail carries only structure.
fn describe_detail(detail: &Element) -> String {
    let mut parts = Vec::new();
    collect_text(detail, &mut parts);
    if parts.is_empty() {
        return detail
            .children
            .first()
            .map(|c| c.local_name().to_string())
            .unwrap_or_default();
    }
    parts.join(" ")
}

fn collect_text<'a>(element: &'a Element, out: &mut Vec<&'a str>) {
    if !element.text.is_empty() {
        out.push(&element.text);
    }
    for child in &element.children {
        collect_text(child, out);
    }
}
