//! Single-flight credential refresh.
//!
//! [`RefreshCoordinator`] guarantees at most one refresh call is outstanding.
//! The first caller spawns a refresh task and parks a shared handle to its
//! result in the coordinator; later callers await the same handle. The task
//! clears the handle before it returns, so once any waiter sees a result the
//! next `refresh` starts a new operation.
//!
//! The refresh runs as its own tokio task: dropping a waiter never cancels it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use super::credential::{Credential, TokenGrant};
use super::storage::CredentialStore;
use crate::config::RefreshConfig;
use crate::error::{DomainError, TransportError};
use crate::net::{Endpoint, Response, Transport};

// =============================================================================
// RefreshProtocol
// =============================================================================

/// How to talk to the credential-refresh endpoint.
pub trait RefreshProtocol: Send + Sync {
    /// Build the refresh request for the credential pinned at operation start.
    fn build(&self, credential: &Credential) -> Result<Endpoint, TransportError>;

    /// Parse a successful refresh response.
    fn parse(&self, response: &Response) -> Result<TokenGrant, TransportError> {
        response.json()
    }
}

/// OAuth2 `refresh_token` grant (RFC 6749 §6) sent as a form POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthRefreshGrant {
    path: String,
    client_id: Option<String>,
}

impl OAuthRefreshGrant {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            client_id: None,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            path: config.path.clone(),
            client_id: config.client_id.clone(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl RefreshProtocol for OAuthRefreshGrant {
    fn build(&self, credential: &Credential) -> Result<Endpoint, TransportError> {
        if credential.refresh_token.is_empty() {
            return Err(TransportError::Other("credential has no refresh token".into()));
        }
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh_token.as_str()),
        ];
        if let Some(client_id) = &self.client_id {
            form.push(("client_id", client_id.as_str()));
        }
        Ok(Endpoint::post(self.path.clone())
            .with_header("Accept", "application/json")
            .with_form(&form)
            .expecting_body())
    }
}

// =============================================================================
// RefreshCoordinator
// =============================================================================

/// Result of one refresh operation, shared by all its waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RefreshOutcome {
    /// Generation of the operation (starts at 1, increases per operation).
    pub generation: u64,
    pub result: Result<(), DomainError>,
    /// The session ended before or during the operation, by sign-out or by
    /// another call chain that already reported it.
    pub session_gone: bool,
}

impl RefreshOutcome {
    fn failed(generation: u64, error: DomainError) -> Self {
        Self {
            generation,
            result: Err(error),
            session_gone: false,
        }
    }

    fn session_gone(generation: u64, detail: &str) -> Self {
        Self {
            generation,
            result: Err(expired(detail)),
            session_gone: true,
        }
    }
}

/// Why an exchange did not produce a stored credential.
enum Abort {
    SessionGone,
    Failed(DomainError),
}

impl From<DomainError> for Abort {
    fn from(err: DomainError) -> Self {
        Self::Failed(err)
    }
}

type SharedOutcome = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    generation: u64,
    outcome: SharedOutcome,
}

#[derive(Default)]
struct Slot {
    in_flight: Option<InFlight>,
    last_generation: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    protocol: Arc<dyn RefreshProtocol>,
    slot: Mutex<Slot>,
    calls: AtomicU64,
}

/// Ensures at most one refresh call is in flight and fans its result out.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        protocol: Arc<dyn RefreshProtocol>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                protocol,
                slot: Mutex::new(Slot::default()),
                calls: AtomicU64::new(0),
            }),
        }
    }

    /// Refresh the credential, or wait for the refresh already in flight.
    ///
    /// Any failure is reported as [`DomainError::CredentialExpired`]; it is
    /// never retried here.
    pub async fn refresh(&self) -> Result<(), DomainError> {
        self.join().await.result
    }

    /// Whether a refresh operation is currently outstanding.
    pub fn in_flight(&self) -> bool {
        self.inner.lock_slot().in_flight.is_some()
    }

    /// Generation of the most recently started operation (0 if none yet).
    pub fn last_generation(&self) -> u64 {
        self.inner.lock_slot().last_generation
    }

    /// Number of refresh calls actually sent to the transport.
    pub fn refresh_calls(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn join(&self) -> RefreshOutcome {
        let outcome = {
            let mut slot = self.inner.lock_slot();
            match &slot.in_flight {
                Some(in_flight) => {
                    debug!(generation = in_flight.generation, "Joining in-flight refresh");
                    in_flight.outcome.clone()
                }
                None => {
                    slot.last_generation += 1;
                    let generation = slot.last_generation;
                    let outcome = self.start(generation);
                    slot.in_flight = Some(InFlight {
                        generation,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Spawn the refresh task for `generation`. Caller holds the slot lock.
    fn start(&self, generation: u64) -> SharedOutcome {
        debug!(generation, "Starting refresh");
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let outcome = inner.run(generation).await;
            inner.finish(generation);
            outcome
        });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(generation, error = %err, "Refresh task aborted");
                    if let Some(inner) = weak.upgrade() {
                        inner.finish(generation);
                    }
                    RefreshOutcome::failed(
                        generation,
                        expired(format!("refresh task aborted: {err}")),
                    )
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the in-flight marker if it still belongs to `generation`.
    fn finish(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if slot
            .in_flight
            .as_ref()
            .is_some_and(|f| f.generation == generation)
        {
            slot.in_flight = None;
        }
    }

    async fn run(&self, generation: u64) -> RefreshOutcome {
        let pinned = match self.store.read() {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!(generation, "No credential to refresh");
                return RefreshOutcome::session_gone(generation, "no credential to refresh");
            }
            Err(e) => {
                warn!(generation, error = %e, "Credential store unreadable");
                return RefreshOutcome::failed(
                    generation,
                    expired(format!("credential store unreadable: {e}")),
                );
            }
        };

        match self.exchange(generation, &pinned).await {
            Ok(()) => RefreshOutcome {
                generation,
                result: Ok(()),
                session_gone: false,
            },
            Err(Abort::SessionGone) => {
                RefreshOutcome::session_gone(generation, "session ended during refresh")
            }
            Err(Abort::Failed(error)) => {
                // Cleared before the slot is released, so no later caller can
                // start another refresh from the dead credential.
                self.discard(generation, &pinned);
                RefreshOutcome::failed(generation, error)
            }
        }
    }

    async fn exchange(&self, generation: u64, pinned: &Credential) -> Result<(), Abort> {
        let endpoint = self.protocol.build(pinned).map_err(|e| {
            warn!(generation, error = %e, "Cannot build refresh request");
            expired(format!("refresh request: {e}"))
        })?;

        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.transport.send(&endpoint).await.map_err(|e| {
            warn!(generation, error = %e, "Refresh call failed");
            expired(format!("refresh failed: {e}"))
        })?;

        let grant = self.protocol.parse(&response).map_err(|e| {
            warn!(generation, error = %e, "Malformed refresh response");
            expired(format!("refresh response: {e}"))
        })?;

        // The session may have ended or been replaced while the call was out.
        match self.store.read() {
            Ok(Some(current)) if current.refresh_token == pinned.refresh_token => {}
            Ok(Some(_)) => {
                info!(generation, "Credential replaced during refresh, keeping newer one");
                return Ok(());
            }
            Ok(None) => {
                info!(generation, "Session ended during refresh");
                return Err(Abort::SessionGone);
            }
            Err(e) => return Err(expired(format!("credential store unreadable: {e}")).into()),
        }

        let updated = pinned.refreshed(grant);
        self.store.write(&updated).map_err(|e| {
            warn!(generation, error = %e, "Failed to persist refreshed credential");
            expired(format!("persist refreshed credential: {e}"))
        })?;

        info!(generation, storage = self.store.name(), "Credential refreshed");
        Ok(())
    }

    /// Drop the credential a failed refresh was working from, unless it has
    /// been replaced since.
    fn discard(&self, generation: u64, pinned: &Credential) {
        match self.store.read() {
            Ok(Some(current)) if current.refresh_token == pinned.refresh_token => {
                if let Err(e) = self.store.clear() {
                    warn!(generation, error = %e, "Failed to clear unrefreshable credential");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(generation, error = %e, "Credential store unreadable"),
        }
    }
}

fn expired(detail: impl Into<String>) -> DomainError {
    DomainError::CredentialExpired(detail.into())
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &self.in_flight())
            .field("last_generation", &self.last_generation())
            .field("store", &self.inner.store.name())
            .finish()
    }
}
