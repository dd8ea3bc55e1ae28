//! Minimal HTTP/1.1 framing for the event server.
//!
//! ```text
//! POST /onvif/events HTTP/1.1
//! Host: 127.0.0.1:18080
//! Content-Type: application/soap+xml; charset=utf-8; action="..."
//! Content-Length: 412
//!
//! <env:Envelope>...</env:Envelope>
//! ```
//!
//! Only `Content-Length` bodies are supported; chunked requests are refused.

use std::io::{BufRead, Read};

/// Requests larger than this are rejected with 413.
pub const MAX_BODY_LEN: usize = 1 << 20;

/// Request line plus headers larger than this are rejected with 431.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

/// Server identification sent on every response.
pub const SERVER_AGENT: &str = concat!("onvif-rs/", env!("CARGO_PKG_VERSION"));

/// Why a request could not be read off the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadError {
    /// The peer closed the connection before sending a request line.
    Closed,
    /// Socket error or EOF mid-request.
    Io(String),
    /// Request line or headers are not valid HTTP.
    Malformed(&'static str),
    /// Declared body exceeds [`MAX_BODY_LEN`].
    TooLarge(usize),
    /// Request line and headers exceed [`MAX_HEAD_LEN`].
    HeadTooLarge,
    /// `Transfer-Encoding` other than identity.
    Unsupported,
}

/// A parsed HTTP request with its body.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    /// Request target, e.g. `/subscription/3`.
    pub path: String,
    pub version: String,
    /// Headers as received; see [`header`](Self::header) for lookups.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse the request line and headers. `head` ends at the blank line.
    pub fn parse_head(head: &str) -> Result<Self, ReadError> {
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(ReadError::Malformed("empty request"))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let [method, target, version] = parts.as_slice() else {
            return Err(ReadError::Malformed("invalid request line"));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(ReadError::Malformed("unsupported HTTP version"));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(ReadError::Malformed("invalid header"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Request {
            method: method.to_string(),
            path: strip_origin(target).to_string(),
            version: version.to_string(),
            headers,
            body: Vec::new(),
        })
    }

    /// Read one complete request (head and body) from `reader`.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self, ReadError> {
        let mut head = String::new();
        loop {
            let budget = MAX_HEAD_LEN.saturating_sub(head.len());
            if budget == 0 {
                return Err(ReadError::HeadTooLarge);
            }
            let mut line = String::new();
            match reader.by_ref().take(budget as u64).read_line(&mut line) {
                Ok(n) if n == budget && !line.ends_with('\n') => {
                    return Err(ReadError::HeadTooLarge);
                }
                Ok(0) if head.trim().is_empty() => return Err(ReadError::Closed),
                Ok(0) => return Err(ReadError::Io("connection closed mid-request".into())),
                Ok(_) => {
                    // Tolerate stray CRLFs between pipelined requests.
                    if head.is_empty() && line.trim().is_empty() {
                        continue;
                    }
                    head.push_str(&line);
                    if line == "\r\n" || line == "\n" {
                        break;
                    }
                }
                Err(e) => return Err(ReadError::Io(e.to_string())),
            }
        }

        let mut request = Self::parse_head(&head)?;

        if request
            .header("Transfer-Encoding")
            .is_some_and(|te| !te.eq_ignore_ascii_case("identity"))
        {
            return Err(ReadError::Unsupported);
        }

        let len = match request.header("Content-Length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| ReadError::Malformed("invalid Content-Length"))?,
            None => 0,
        };
        if len > MAX_BODY_LEN {
            return Err(ReadError::TooLarge(len));
        }

        request.body = vec![0; len];
        reader
            .read_exact(&mut request.body)
            .map_err(|e| ReadError::Io(e.to_string()))?;
        Ok(request)
    }

    /// Header value by name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the client asked to close the connection after this exchange.
    pub fn wants_close(&self) -> bool {
        match self.header("Connection") {
            Some(c) => c.eq_ignore_ascii_case("close"),
            None => self.version == "HTTP/1.0",
        }
    }
}

/// Absolute-form targets (`http://host/path`) are reduced to their path.
fn strip_origin(target: &str) -> &str {
    target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
        .map(|rest| rest.find('/').map_or("/", |i| &rest[i..]))
        .unwrap_or(target)
}

/// An HTTP response. `Content-Length` is always written.
#[must_use]
#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status_code: u16) -> Self {
        Response {
            status_code,
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: Vec::new(),
        }
    }

    /// A SOAP 1.2 response carrying an encoded envelope.
    pub fn soap(status_code: u16, envelope: Vec<u8>) -> Self {
        Self::new(status_code)
            .add_header("Content-Type", "application/soap+xml; charset=utf-8")
            .with_body(envelope)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status_code,
            reason_phrase(self.status_code)
        );
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}
