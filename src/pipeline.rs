//! Authenticated request pipeline.
//!
//! Every authenticated call goes through at most two attempts. A rejected
//! credential on the first attempt triggers one (shared) refresh and a retry
//! with the refreshed credential; a rejection on the retry ends the session.

use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::classify::ErrorClassifier;
use crate::config::{Config, StorageBackend};
use crate::error::{DomainError, StoreError};
use crate::net::{Endpoint, HttpTransport, Response, Transport};
use crate::session::observer::ExpiryNotifier;
use crate::session::{
    CachedCredentialStore, Credential, CredentialStore, ExpiryReason, FileSecureStorage,
    MemorySecureStorage, OAuthRefreshGrant, RefreshCoordinator, RefreshProtocol, SessionExpired,
    SessionObserver,
};

/// Position of a request within its call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAttempt {
    First,
    /// After a successful refresh. Has no successor.
    Retry,
}

impl RequestAttempt {
    /// The attempt that may follow a credential rejection, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::First => Some(Self::Retry),
            Self::Retry => None,
        }
    }

    /// 1-based attempt number.
    pub fn number(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Retry => 2,
        }
    }
}

/// Issues plain and authenticated requests over a [`Transport`].
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    classifier: ErrorClassifier,
    refresher: RefreshCoordinator,
    notifier: ExpiryNotifier,
}

impl RequestPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Send a request without credentials. Failures are classified, never retried.
    pub async fn plain_request(&self, endpoint: &Endpoint) -> Result<Response, DomainError> {
        debug!(method = %endpoint.method(), path = endpoint.path(), "Sending plain request");
        self.transport
            .send(endpoint)
            .await
            .map_err(|e| self.classifier.classify(&e))
    }

    /// [`plain_request`](Self::plain_request) and decode the JSON body.
    pub async fn plain_json<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
    ) -> Result<T, DomainError> {
        let response = self.plain_request(endpoint).await?;
        response.json().map_err(|e| self.classifier.classify(&e))
    }

    /// Send a request built from the current credential.
    ///
    /// `factory` is invoked once per attempt with the credential read from the
    /// store at that moment, so the retry always carries the refreshed token.
    pub async fn authenticated_request<F, E>(&self, factory: F) -> Result<Response, DomainError>
    where
        F: Fn(&Credential) -> Result<Endpoint, E>,
        E: Display,
    {
        let span = info_span!("authenticated_request", request_id = %Uuid::new_v4());
        self.run_authenticated(&factory).instrument(span).await
    }

    /// [`authenticated_request`](Self::authenticated_request) and decode the JSON body.
    pub async fn authenticated_json<T, F, E>(&self, factory: F) -> Result<T, DomainError>
    where
        T: DeserializeOwned,
        F: Fn(&Credential) -> Result<Endpoint, E>,
        E: Display,
    {
        let response = self.authenticated_request(factory).await?;
        response.json().map_err(|e| self.classifier.classify(&e))
    }

    /// Authenticated request for a fixed endpoint: the bearer header is
    /// applied from the current credential on each attempt.
    pub async fn authorized(&self, template: &Endpoint) -> Result<Response, DomainError> {
        self.authenticated_request(|credential| {
            Ok::<_, Infallible>(template.clone().with_bearer(credential))
        })
        .await
    }

    /// Store a freshly obtained credential.
    pub fn sign_in(&self, credential: Credential) -> Result<(), StoreError> {
        self.store.write(&credential)?;
        debug!(storage = self.store.name(), "Signed in");
        Ok(())
    }

    /// Forget the stored credential. Does not notify the observer.
    pub fn sign_out(&self) -> Result<(), StoreError> {
        self.store.clear()?;
        debug!(storage = self.store.name(), "Signed out");
        Ok(())
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self.store.read(), Ok(Some(_)))
    }

    pub fn current_credential(&self) -> Result<Option<Credential>, StoreError> {
        self.store.read()
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    async fn run_authenticated<F, E>(&self, factory: &F) -> Result<Response, DomainError>
    where
        F: Fn(&Credential) -> Result<Endpoint, E>,
        E: Display,
    {
        let mut attempt = RequestAttempt::First;
        let mut generation = 0;
        loop {
            let credential = self.credential_for(attempt)?;
            let err = match self.attempt(factory, &credential, attempt).await {
                Err(err) if err.is_credential_expired() => err,
                result => return result,
            };
            let Some(next) = attempt.next() else {
                warn!(generation, "Refreshed credential rejected");
                self.end_session(generation, ExpiryReason::RetryRejected);
                return Err(err);
            };

            // The rejection may describe a session that has since moved on.
            match self.store.read() {
                Ok(None) => {
                    debug!("Credential rejected after the session ended");
                    return Err(err);
                }
                Ok(Some(current)) if current.access_token != credential.access_token => {
                    debug!(attempt = attempt.number(), "Credential already refreshed, retrying");
                    generation = self.refresher.last_generation();
                }
                _ => {
                    debug!(attempt = attempt.number(), "Credential rejected, refreshing");
                    let outcome = self.refresher.join().await;
                    generation = outcome.generation;
                    if let Err(refresh_err) = outcome.result {
                        if !outcome.session_gone {
                            self.end_session(generation, ExpiryReason::RefreshFailed);
                        }
                        return Err(refresh_err);
                    }
                }
            }
            attempt = next;
        }
    }

    fn credential_for(&self, attempt: RequestAttempt) -> Result<Credential, DomainError> {
        self.store
            .read()
            .map_err(|e| DomainError::Unknown(format!("credential store: {e}")))?
            .ok_or_else(|| match attempt {
                RequestAttempt::First => DomainError::Unknown("not signed in".into()),
                // Another call chain ended the session while this one waited.
                RequestAttempt::Retry => {
                    DomainError::CredentialExpired("session ended before retry".into())
                }
            })
    }

    async fn attempt<F, E>(
        &self,
        factory: &F,
        credential: &Credential,
        attempt: RequestAttempt,
    ) -> Result<Response, DomainError>
    where
        F: Fn(&Credential) -> Result<Endpoint, E>,
        E: Display,
    {
        let endpoint =
            factory(credential).map_err(|e| DomainError::Unknown(format!("endpoint: {e}")))?;

        debug!(
            attempt = attempt.number(),
            method = %endpoint.method(),
            path = endpoint.path(),
            "Sending authenticated request"
        );
        self.transport
            .send(&endpoint)
            .await
            .map_err(|e| self.classifier.classify(&e))
    }

    /// Terminal expiry: the first caller per generation clears the store and
    /// notifies the observer.
    fn end_session(&self, generation: u64, reason: ExpiryReason) {
        if !self.notifier.claim(generation) {
            return;
        }
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear expired credential");
        }
        self.notifier.deliver(&SessionExpired { generation, reason });
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("store", &self.store.name())
            .field("classifier", &self.classifier)
            .field("refresher", &self.refresher)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`RequestPipeline`].
///
/// Defaults: an [`HttpTransport`] with no base URL, an in-memory credential
/// store, [`OAuthRefreshGrant`] at `/oauth/token`, the default classifier and
/// no observer.
#[derive(Default)]
pub struct PipelineBuilder {
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn CredentialStore>>,
    protocol: Option<Arc<dyn RefreshProtocol>>,
    classifier: ErrorClassifier,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl PipelineBuilder {
    /// Builder wired from configuration: HTTP transport, configured storage
    /// backend, refresh grant and expired statuses.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn CredentialStore> = match config.storage.backend {
            StorageBackend::File => Arc::new(CachedCredentialStore::with_account(
                FileSecureStorage::new(&config.storage.dir),
                &config.storage.account,
            )),
            StorageBackend::Memory => Arc::new(CachedCredentialStore::with_account(
                MemorySecureStorage::new(),
                &config.storage.account,
            )),
            #[cfg(feature = "system-keyring")]
            StorageBackend::Keyring => Arc::new(CachedCredentialStore::with_account(
                crate::session::KeyringSecureStorage::with_service(&config.storage.keyring_service),
                &config.storage.account,
            )),
            #[cfg(not(feature = "system-keyring"))]
            StorageBackend::Keyring => {
                anyhow::bail!("keyring storage requires the `system-keyring` feature")
            }
        };

        Ok(Self::default()
            .transport(HttpTransport::from_config(&config.transport))
            .store_arc(store)
            .refresh_protocol(OAuthRefreshGrant::from_config(&config.refresh))
            .classifier(ErrorClassifier::new(config.refresh.expired_statuses.clone())))
    }

    #[must_use]
    pub fn transport(self, transport: impl Transport + 'static) -> Self {
        self.transport_arc(Arc::new(transport))
    }

    #[must_use]
    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn store(self, store: impl CredentialStore + 'static) -> Self {
        self.store_arc(Arc::new(store))
    }

    #[must_use]
    pub fn store_arc(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn refresh_protocol(mut self, protocol: impl RefreshProtocol + 'static) -> Self {
        self.protocol = Some(Arc::new(protocol));
        self
    }

    #[must_use]
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: impl SessionObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> RequestPipeline {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(CachedCredentialStore::new(MemorySecureStorage::new())));
        let protocol = self
            .protocol
            .unwrap_or_else(|| Arc::new(OAuthRefreshGrant::new("/oauth/token")));

        RequestPipeline {
            refresher: RefreshCoordinator::new(transport.clone(), store.clone(), protocol),
            transport,
            store,
            classifier: self.classifier,
            notifier: ExpiryNotifier::new(self.observer),
        }
    }
}
