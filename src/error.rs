//! Error types for the request pipeline.
//!
//! - [`DomainError`] is the closed classification every caller sees.
//! - [`TransportError`] is what a [`Transport`](crate::net::Transport) raises.
//! - [`StoreError`] is what a credential backend raises.

use std::fmt;

// =============================================================================
// DomainError
// =============================================================================

/// Discriminant of a [`DomainError`], used for matching without the detail text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkUnavailable,
    CredentialExpired,
    EmptyResponse,
    BadRequest,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkUnavailable => write!(f, "network_unavailable"),
            Self::CredentialExpired => write!(f, "credential_expired"),
            Self::EmptyResponse => write!(f, "empty_response"),
            Self::BadRequest => write!(f, "bad_request"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classified failure surfaced to callers of the pipeline.
///
/// Each kind has exactly one recovery policy:
///
/// | Kind | Policy |
/// |---|---|
/// | `NetworkUnavailable` | surface, caller may retry later |
/// | `CredentialExpired` | refresh once and retry; terminal otherwise |
/// | `EmptyResponse` | surface |
/// | `BadRequest` | surface |
/// | `Unknown` | surface |
///
/// The string payload is a human-readable detail for logs only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    #[error("Empty response: {0}")]
    EmptyResponse(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl DomainError {
    /// The kind of this error, without the detail.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            Self::CredentialExpired(_) => ErrorKind::CredentialExpired,
            Self::EmptyResponse(_) => ErrorKind::EmptyResponse,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// The detail message attached at classification time.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::NetworkUnavailable(d)
            | Self::CredentialExpired(d)
            | Self::EmptyResponse(d)
            | Self::BadRequest(d)
            | Self::Unknown(d) => d,
        }
    }

    /// Whether this error means the session can no longer be used.
    #[must_use]
    pub fn is_credential_expired(&self) -> bool {
        self.kind() == ErrorKind::CredentialExpired
    }
}

// =============================================================================
// TransportError
// =============================================================================

/// Raw failure of a single request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not reach the server (DNS, refused connection, TLS, reset).
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Request timed out")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The server answered successfully but without the body the caller expected.
    #[error("Response body is empty")]
    EmptyBody,

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::Connectivity(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Other(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

// =============================================================================
// StoreError
// =============================================================================

/// Errors raised by credential storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Storage serialization error: {0}")]
    Serialization(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Storage error: {0}")]
    Other(String),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, message: impl fmt::Display) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
