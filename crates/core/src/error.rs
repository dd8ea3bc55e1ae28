//! Error types for the ONVIF protocol engine.

use std::fmt;

use crate::soap::Fault;
use crate::transport::TransportError;

/// Errors that can occur in the ONVIF protocol engine.
///
/// Variants fall into four categories (see [`ErrorCategory`]):
///
/// - **Validation**: [`Validation`](Self::Validation),
///   [`InvalidDuration`](Self::InvalidDuration): rejected before any I/O.
/// - **Transport**: [`Transport`](Self::Transport),
///   [`Cancelled`](Self::Cancelled), [`TimedOut`](Self::TimedOut): the HTTP
///   exchange did not produce a usable envelope.
/// - **Fault**: [`Fault`](Self::Fault): the peer answered with a SOAP fault.
/// - **Decode**: [`Decode`](Self::Decode): the response did not have the
///   expected shape.
///
/// [`Io`](Self::Io), [`AlreadyRunning`](Self::AlreadyRunning) and
/// [`NotStarted`](Self::NotStarted) belong to the reference server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Arguments rejected client-side; no request was sent.
    #[error("{operation}: invalid argument: {reason}")]
    Validation {
        operation: &'static str,
        reason: String,
    },

    /// A `PT[nH][nM][nS]` token could not be parsed.
    #[error("invalid duration {token:?}: {kind}")]
    InvalidDuration { token: String, kind: DurationErrorKind },

    /// The HTTP exchange failed (connect error, non-2xx without fault body, ...).
    #[error("{operation}: transport error: {source}")]
    Transport {
        operation: String,
        #[source]
        source: TransportError,
    },

    /// The call was cancelled through its [`CancelToken`](crate::transport::CancelToken).
    #[error("{operation}: cancelled")]
    Cancelled { operation: String },

    /// The call's deadline elapsed before a response arrived.
    #[error("{operation}: deadline exceeded")]
    TimedOut { operation: String },

    /// The peer returned a SOAP fault.
    #[error("{operation}: device fault: {fault}")]
    Fault { operation: String, fault: Fault },

    /// The response envelope did not match the expected result shape.
    #[error("{operation}: malformed response: {reason}")]
    Decode { operation: String, reason: String },

    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// [`EventServer::start`](crate::server::EventServer::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// [`EventServer::start`](crate::server::EventServer::start) has not been called yet.
    #[error("server not started")]
    NotStarted,
}

/// Broad classification of an [`Error`], so callers can branch on retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Transport,
    Fault,
    Decode,
    /// Local I/O and server lifecycle errors.
    Local,
}

impl Error {
    pub(crate) fn validation(operation: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            operation,
            reason: reason.into(),
        }
    }

    /// Map a transport failure onto the error surfaced for `operation`.
    ///
    /// Cancellation and deadline expiry get their own variants so they can
    /// be told apart from network failures.
    pub(crate) fn from_transport(operation: &str, source: TransportError) -> Self {
        match source {
            TransportError::Cancelled => Error::Cancelled {
                operation: operation.to_string(),
            },
            TransportError::TimedOut => Error::TimedOut {
                operation: operation.to_string(),
            },
            source => Error::Transport {
                operation: operation.to_string(),
                source,
            },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation { .. } | Error::InvalidDuration { .. } => ErrorCategory::Validation,
            Error::Transport { .. } | Error::Cancelled { .. } | Error::TimedOut { .. } => {
                ErrorCategory::Transport
            }
            Error::Fault { .. } => ErrorCategory::Fault,
            Error::Decode { .. } => ErrorCategory::Decode,
            Error::Io(_) | Error::AlreadyRunning | Error::NotStarted => ErrorCategory::Local,
        }
    }

    /// Whether a caller-side backoff retry could plausibly succeed.
    ///
    /// Only transport failures qualify. Cancellation is the caller's own
    /// decision and faults are answers from the device.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::TimedOut { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// The SOAP fault carried by this error, if the peer sent one.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::Fault { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// Specific kind of duration token parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurationErrorKind {
    /// Input was empty.
    Empty,
    /// Token did not start with `PT`.
    MissingPrefix,
    /// Token had `PT` but no components.
    NoComponents,
    /// A component carried a minus sign.
    Negative,
    /// A component value was not a decimal number.
    NotNumeric,
    /// A designator other than `H`, `M` or `S`, or a number with no designator.
    UnknownDesignator,
    /// Components repeated or out of `H`, `M`, `S` order.
    OutOfOrder,
    /// Value does not fit a [`std::time::Duration`].
    Overflow,
}

impl fmt::Display for DurationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty token"),
            Self::MissingPrefix => write!(f, "missing PT prefix"),
            Self::NoComponents => write!(f, "no components"),
            Self::Negative => write!(f, "negative component"),
            Self::NotNumeric => write!(f, "non-numeric component"),
            Self::UnknownDesignator => write!(f, "unknown designator"),
            Self::OutOfOrder => write!(f, "components out of order"),
            Self::Overflow => write!(f, "value out of range"),
        }
    }
}

/// Convenience alias for `Result<T, onvif::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
