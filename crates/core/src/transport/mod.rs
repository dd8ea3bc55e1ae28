//! HTTP transport for SOAP exchanges.
//!
//! The transport only moves bytes: it POSTs an encoded envelope and hands
//! back the status code and the fully drained response body. Deciding
//! whether a body is a result, a fault, or garbage is the dispatcher's job
//! ([`crate::client::Client::call`]).
//!
//! - [`Transport`] is the seam the dispatcher talks to, so tests can swap in
//!   a scripted peer.
//! - [`HttpTransport`] is the production implementation over a pooled,
//!   thread-safe `reqwest` blocking client.
//! - [`CallContext`] carries the per-call deadline and [`CancelToken`].

pub mod http;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub use http::HttpTransport;

/// An outgoing HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A received HTTP response with its body fully read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure to complete an HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// TCP/TLS connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request failed after connecting (reset, protocol error, ...).
    #[error("request failed: {0}")]
    Request(String),

    /// Non-2xx status whose body was not a SOAP fault.
    #[error("HTTP status {status}{}", body_excerpt(.body))]
    Status { status: u16, body: String },

    /// The call's deadline elapsed.
    #[error("deadline exceeded")]
    TimedOut,

    /// The call's cancel token was triggered.
    #[error("cancelled")]
    Cancelled,
}

fn body_excerpt(body: &str) -> String {
    const MAX: usize = 120;
    let body = body.trim();
    if body.is_empty() {
        return String::new();
    }
    match body.char_indices().nth(MAX) {
        Some((cut, _)) => format!(": {}...", &body[..cut]),
        None => format!(": {body}"),
    }
}

/// Sends one HTTP POST and returns the drained response.
///
/// Implementations must be safe to share between threads; the dispatcher
/// holds one behind an `Arc` and issues calls from any caller thread.
pub trait Transport: Send + Sync {
    fn post(&self, request: HttpRequest, ctx: &CallContext) -> Result<HttpResponse, TransportError>;
}

/// Cooperative cancellation flag shared between a caller and its calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation for one blocking call.
///
/// Without a deadline the transport falls back to its own default timeout.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancelToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose deadline is `timeout` from now. A timeout too large to
    /// represent as an instant leaves the context unbounded.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::new().deadline_at(deadline),
            None => Self::new(),
        }
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Time left before the deadline (zero once passed), `None` if unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err` if the call has been cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), TransportError> {
        if self.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if self.remaining().is_some_and(|r| r.is_zero()) {
            return Err(TransportError::TimedOut);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Transport that replays scripted responses and records every request.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn reply(&self, status: u16, body: impl Into<String>) {
            self.replies.lock().push_back(Ok(HttpResponse {
                status,
                body: body.into().into_bytes(),
            }));
        }

        pub(crate) fn fail(&self, error: TransportError) {
            self.replies.lock().push_back(Err(error));
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().len()
        }

        pub(crate) fn request_body(&self, index: usize) -> String {
            String::from_utf8_lossy(&self.requests.lock()[index].body).into_owned()
        }

        pub(crate) fn request(&self, index: usize) -> HttpRequest {
            self.requests.lock()[index].clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn post(
            &self,
            request: HttpRequest,
            ctx: &CallContext,
        ) -> Result<HttpResponse, TransportError> {
            ctx.check()?;
            self.requests.lock().push(request);
            self.replies
                .lock()
                .pop_front()
                .unwrap_or(Err(TransportError::Connect("no scripted reply".to_string())))
        }
    }

    /// Wrap `body` in a SOAP 1.2 envelope.
    pub(crate) fn envelope(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"><env:Body>{body}</env:Body></env:Envelope>"#
        )
    }
}
