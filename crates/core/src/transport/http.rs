use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use super::{CallContext, HttpRequest, HttpResponse, Transport, TransportError};

/// Default per-request timeout when the [`CallContext`] has no deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str = concat!("onvif-rs/", env!("CARGO_PKG_VERSION"));

/// How often a waiting caller checks its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// [`Transport`] over a pooled `reqwest` blocking client.
///
/// Cloning is cheap and clones share the connection pool, so one instance
/// can serve every service endpoint of a device (or several devices).
///
/// The per-request timeout is the context's remaining deadline, falling back
/// to `default_timeout`; an expired deadline aborts the in-flight request.
/// Each exchange runs on its own short-lived thread while the caller waits
/// on a channel and watches the cancel token, so cancelling returns at once
/// and the abandoned exchange is dropped when it completes or times out.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    default_timeout: Duration,
}

impl HttpTransport {
    pub fn new(default_timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, default_timeout))
    }

    /// Use a caller-configured client (TLS roots, proxies, pool limits).
    pub fn with_client(client: reqwest::blocking::Client, default_timeout: Duration) -> Self {
        Self {
            client,
            default_timeout,
        }
    }
}

impl Transport for HttpTransport {
    fn post(&self, request: HttpRequest, ctx: &CallContext) -> Result<HttpResponse, TransportError> {
        ctx.check()?;

        let timeout = ctx.remaining().unwrap_or(self.default_timeout);
        tracing::trace!(
            url = %request.url,
            bytes = request.body.len(),
            timeout_ms = timeout.as_millis() as u64,
            "HTTP POST"
        );

        let (tx, rx) = mpsc::sync_channel(1);
        let client = self.client.clone();
        let url = request.url.clone();
        thread::Builder::new()
            .name("onvif-http".to_string())
            .spawn(move || {
                let _ = tx.send(exchange(&client, request, timeout));
            })
            .map_err(|e| TransportError::Request(format!("failed to spawn request thread: {e}")))?;

        let response = loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(result) => break result?,
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.is_cancelled() {
                        tracing::debug!(%url, "request cancelled in flight");
                        return Err(TransportError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Request("request thread exited".to_string()));
                }
            }
        };

        tracing::trace!(%url, status = response.status, bytes = response.body.len(), "HTTP response");

        if ctx.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        Ok(response)
    }
}

fn exchange(
    client: &reqwest::blocking::Client,
    request: HttpRequest,
    timeout: Duration,
) -> Result<HttpResponse, TransportError> {
    let mut builder = client.post(&request.url).timeout(timeout).body(request.body);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.send().map_err(classify)?;
    let status = response.status().as_u16();
    // Reading the body to the end returns the connection to the pool.
    let body = response.bytes().map_err(classify)?;
    Ok(HttpResponse {
        status,
        body: body.to_vec(),
    })
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::TimedOut
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Request(error.to_string())
    }
}
