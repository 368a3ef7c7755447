//! Mapping of raw transport failures onto [`DomainError`].

use crate::error::{DomainError, TransportError};

/// Statuses treated as "credential rejected" unless configured otherwise.
pub const DEFAULT_EXPIRED_STATUSES: &[u16] = &[401];

/// Total, side-effect-free classifier.
///
/// | Raw failure | Kind |
/// |---|---|
/// | connectivity, timeout | `NetworkUnavailable` |
/// | status in the expired set | `CredentialExpired` |
/// | other 4xx | `BadRequest` |
/// | empty body | `EmptyResponse` |
/// | 5xx, decode failure, anything else | `Unknown` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassifier {
    expired_statuses: Vec<u16>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRED_STATUSES.to_vec())
    }
}

impl ErrorClassifier {
    /// Classifier treating the given statuses as credential expiry.
    pub fn new(expired_statuses: Vec<u16>) -> Self {
        Self { expired_statuses }
    }

    pub fn expired_statuses(&self) -> &[u16] {
        &self.expired_statuses
    }

    /// Classify a raw transport failure.
    #[must_use]
    pub fn classify(&self, err: &TransportError) -> DomainError {
        match err {
            TransportError::Connectivity(msg) => DomainError::NetworkUnavailable(msg.clone()),
            TransportError::Timeout => DomainError::NetworkUnavailable(err.to_string()),
            TransportError::Status { status, .. } if self.expired_statuses.contains(status) => {
                DomainError::CredentialExpired(format!("HTTP {status}"))
            }
            TransportError::Status { status, body } if (400..500).contains(status) => {
                DomainError::BadRequest(format!("HTTP {status}: {}", truncate(body)))
            }
            TransportError::Status { status, body } => {
                DomainError::Unknown(format!("HTTP {status}: {}", truncate(body)))
            }
            TransportError::EmptyBody => DomainError::EmptyResponse(err.to_string()),
            TransportError::Decode(msg) => DomainError::Unknown(format!("decode: {msg}")),
            TransportError::Other(msg) => DomainError::Unknown(msg.clone()),
        }
    }
}

/// Keep server bodies in details short.
fn truncate(body: &str) -> &str {
    const MAX: usize = 256;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
