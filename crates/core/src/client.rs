//! RPC dispatcher: the single `call` primitive every operation goes through.
//!
//! ```text
//! Operation ──to_element──▶ Envelope (+ wsse:Security if credentials)
//!           ──encode──────▶ HTTP POST ──▶ status + body
//!           ──decode──────▶ {Name}Response → O::Response | Fault | transport/decode error
//! ```
//!
//! Exactly one network exchange happens per call. Nothing is retried here:
//! operations such as `Renew` are not guaranteed idempotent, so retry policy
//! belongs to the caller (see [`Error::is_retryable`]).

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::security::{Credentials, UsernameToken};
use crate::soap::{self, DecodeError, Element, Envelope, Namespaces, Response};
use crate::transport::{CallContext, HttpRequest, HttpTransport, Transport};

/// One RPC: how to build the request element and what comes back.
///
/// Implementing this trait is all a service wrapper needs; encoding,
/// authentication, transport and fault handling are shared.
pub trait Operation {
    type Response: Response;

    /// Operation name, e.g. `PullMessages`. Used in logs and errors.
    fn name(&self) -> &str;

    /// SOAP action URI, sent as the `action` parameter of the Content-Type.
    fn action(&self, namespaces: &Namespaces) -> String;

    /// The request payload placed in the envelope body.
    fn to_element(&self, namespaces: &Namespaces) -> Element;
}

/// Untyped operation: send a prebuilt element and get the response payload back.
#[derive(Debug, Clone)]
pub struct RawOperation {
    pub name: String,
    pub action: String,
    pub element: Element,
}

impl Operation for RawOperation {
    type Response = Element;

    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self, _: &Namespaces) -> String {
        self.action.clone()
    }

    fn to_element(&self, _: &Namespaces) -> Element {
        self.element.clone()
    }
}

impl Response for Element {
    fn from_element(element: &Element) -> std::result::Result<Self, String> {
        Ok(element.clone())
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `None` (or an empty username) sends requests unauthenticated.
    pub credentials: Option<Credentials>,
    /// HTTP timeout for calls whose context carries no deadline.
    pub timeout: Duration,
    /// Namespace URIs written into outgoing envelopes.
    pub namespaces: Namespaces,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            timeout: crate::transport::http::DEFAULT_TIMEOUT,
            namespaces: Namespaces::default(),
            user_agent: crate::transport::http::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// RPC dispatcher over a shared [`Transport`].
///
/// `Clone + Send + Sync`: clones share the transport and its connection pool.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
}

impl Client {
    /// Create a client backed by a new [`HttpTransport`].
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.timeout, &config.user_agent)
            .map_err(|e| Error::from_transport("client", e))?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Create a client over any transport (a shared pool, a test double, ...).
    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Perform one RPC against `endpoint`.
    ///
    /// - 2xx with a result payload: `Ok(response)`.
    /// - Any status with a fault body: [`Error::Fault`].
    /// - Non-2xx without a fault body: [`Error::Transport`] carrying the status.
    /// - Payload of the wrong shape: [`Error::Decode`].
    /// - Cancelled / deadline: [`Error::Cancelled`] / [`Error::TimedOut`].
    pub fn call<O: Operation>(
        &self,
        ctx: &CallContext,
        endpoint: &str,
        operation: &O,
    ) -> Result<O::Response> {
        let name = operation.name();
        let namespaces = &self.config.namespaces;

        let mut envelope = Envelope::new(operation.to_element(namespaces));
        let token = self
            .config
            .credentials
            .as_ref()
            .and_then(UsernameToken::generate);
        let authenticated = token.is_some();
        if let Some(token) = token {
            envelope = envelope.with_header(token.to_element());
        }

        let request = HttpRequest {
            url: endpoint.to_string(),
            headers: vec![(
                "Content-Type".to_string(),
                format!(
                    "application/soap+xml; charset=utf-8; action=\"{}\"",
                    operation.action(namespaces)
                ),
            )],
            body: envelope.encode(namespaces),
        };

        tracing::debug!(operation = name, endpoint, authenticated, "calling");

        let response = self.transport.post(request, ctx).map_err(|e| {
            tracing::warn!(operation = name, endpoint, error = %e, "transport failure");
            Error::from_transport(name, e)
        })?;

        if ctx.is_cancelled() {
            return Err(Error::Cancelled {
                operation: name.to_string(),
            });
        }

        if !response.is_success() {
            if let Some(fault) = soap::parse_fault(&response.body) {
                tracing::debug!(operation = name, status = response.status, %fault, "fault");
                return Err(Error::Fault {
                    operation: name.to_string(),
                    fault,
                });
            }
            tracing::warn!(operation = name, endpoint, status = response.status, "HTTP error");
            return Err(Error::from_transport(
                name,
                crate::transport::TransportError::Status {
                    status: response.status,
                    body: String::from_utf8_lossy(&response.body).into_owned(),
                },
            ));
        }

        match soap::decode_response::<O::Response>(&response.body, name) {
            Ok(result) => Ok(result),
            Err(DecodeError::Fault(fault)) => {
                tracing::debug!(operation = name, %fault, "fault");
                Err(Error::Fault {
                    operation: name.to_string(),
                    fault,
                })
            }
            Err(DecodeError::Malformed(reason)) => {
                tracing::warn!(operation = name, endpoint, %reason, "malformed response");
                Err(Error::Decode {
                    operation: name.to_string(),
                    reason,
                })
            }
        }
    }

    /// [`call`](Self::call) with a prebuilt request element.
    pub fn call_raw(
        &self,
        ctx: &CallContext,
        endpoint: &str,
        name: &str,
        action: &str,
        element: Element,
    ) -> Result<Element> {
        let operation = RawOperation {
            name: name.to_string(),
            action: action.to_string(),
            element,
        };
        self.call(ctx, endpoint, &operation)
    }
}
