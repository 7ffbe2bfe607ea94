//! Error types for the transport layer.
//!
//! [`WireFailure`] describes what went wrong on a single attempt and feeds
//! retry classification. [`TransportError`] is what a caller sees once the
//! channel has given up; [`FailureKind`] is its compact, copyable label used
//! in per-identifier outcomes.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Failure of a single wire attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireFailure {
    /// Non-success HTTP status other than 404.
    #[error("HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// Request timed out before completion.
    #[error("request timed out")]
    Timeout,

    /// Connection-level error (DNS, refused, reset, TLS).
    #[error("network error: {message}")]
    Network {
        /// Error text from the HTTP stack.
        message: String,
        /// Whether the error came from TLS/certificate handling.
        tls: bool,
    },

    /// The body could not be decoded as JSON.
    #[error("undecodable response: {message}")]
    Decode {
        /// Decoder error text.
        message: String,
    },
}

impl WireFailure {
    /// Creates a status failure without Retry-After.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self::Status {
            status,
            retry_after: None,
        }
    }

    /// Creates a network failure, flagging TLS problems from the message text.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        let tls = lowered.contains("certificate")
            || lowered.contains("tls")
            || lowered.contains("ssl")
            || lowered.contains("handshake");
        Self::Network { message, tls }
    }

    /// Creates a decode failure.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

/// Compact label for a transport failure, carried in row outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failures persisted past the retry cap.
    RetriesExhausted,
    /// The remote refused the request with a permanent status.
    Rejected,
    /// A permanent connection-level fault (e.g. TLS).
    Unrecoverable,
    /// The payload was unreadable or structurally invalid.
    MalformedPayload,
    /// Continuation tokens kept coming past the page cap.
    PaginationLimit,
}

impl FailureKind {
    /// Stable label for display output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Rejected => "rejected",
            Self::Unrecoverable => "unrecoverable",
            Self::MalformedPayload => "malformed_payload",
            Self::PaginationLimit => "pagination_limit",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request the channel could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Transient failures persisted through every allowed attempt.
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Requested URL.
        url: String,
        /// Attempts made.
        attempts: u32,
        /// The final attempt's failure.
        last: String,
    },

    /// The remote answered with a permanent error status.
    #[error("remote rejected {url} with HTTP {status}")]
    Rejected {
        /// Requested URL.
        url: String,
        /// HTTP status.
        status: u16,
    },

    /// A permanent connection-level fault.
    #[error("cannot reach {url}: {message}")]
    Unrecoverable {
        /// Requested URL.
        url: String,
        /// Error text.
        message: String,
    },

    /// The response could not be used.
    #[error("malformed response from {url}: {message}")]
    Malformed {
        /// Requested URL.
        url: String,
        /// What was wrong.
        message: String,
    },

    /// Pagination did not terminate within the page cap.
    #[error("pagination from {url} exceeded {pages} pages")]
    PaginationLimit {
        /// First-page URL.
        url: String,
        /// Page cap.
        pages: u32,
    },
}

impl TransportError {
    /// Builds the terminal error for a failure that will not be retried.
    #[must_use]
    pub fn from_wire(url: &str, failure: &WireFailure, attempts: u32, exhausted: bool) -> Self {
        if exhausted {
            return Self::RetriesExhausted {
                url: url.to_string(),
                attempts,
                last: failure.to_string(),
            };
        }
        match failure {
            WireFailure::Status { status, .. } => Self::Rejected {
                url: url.to_string(),
                status: *status,
            },
            WireFailure::Decode { message } => Self::Malformed {
                url: url.to_string(),
                message: message.clone(),
            },
            WireFailure::Network { message, .. } => Self::Unrecoverable {
                url: url.to_string(),
                message: message.clone(),
            },
            WireFailure::Timeout => Self::RetriesExhausted {
                url: url.to_string(),
                attempts,
                last: failure.to_string(),
            },
        }
    }

    /// Creates a malformed-payload error.
    #[must_use]
    pub fn malformed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// The compact label for this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            Self::Rejected { .. } => FailureKind::Rejected,
            Self::Unrecoverable { .. } => FailureKind::Unrecoverable,
            Self::Malformed { .. } => FailureKind::MalformedPayload,
            Self::PaginationLimit { .. } => FailureKind::PaginationLimit,
        }
    }

    /// True for a 400 Bad Request, which PubChem uses for unparseable
    /// identifiers.
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::Rejected { status: 400, .. })
    }
}
