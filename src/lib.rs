//! Authenticated request pipeline.
//!
//! Issues requests over a [`Transport`](net::Transport), classifies failures
//! into a closed set of [`DomainError`] kinds, and recovers from a rejected
//! credential with a single-flight refresh followed by exactly one retry.
//! When the session cannot be recovered the stored credential is cleared and
//! the [`SessionObserver`] is told once per refresh generation.

pub mod classify;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod pipeline;
pub mod session;

pub use classify::ErrorClassifier;
pub use config::Config;
pub use error::{DomainError, ErrorKind, StoreError, TransportError};
pub use net::{Endpoint, HttpTransport, Response, Transport};
pub use pipeline::{PipelineBuilder, RequestAttempt, RequestPipeline};
pub use session::{
    Credential, CredentialStore, ExpiryReason, RefreshCoordinator, SessionExpired,
    SessionObserver,
};
