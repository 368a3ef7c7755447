//! Session-expired notification.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// The refresh call itself failed.
    RefreshFailed,
    /// The refresh succeeded but the retried request was rejected again.
    RetryRejected,
}

/// Event delivered to a [`SessionObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpired {
    /// Generation of the refresh operation the failing calls depended on.
    pub generation: u64,
    pub reason: ExpiryReason,
}

/// Receives "the user must be signed out" events.
pub trait SessionObserver: Send + Sync {
    fn session_expired(&self, event: &SessionExpired);
}

impl<F> SessionObserver for F
where
    F: Fn(&SessionExpired) + Send + Sync,
{
    fn session_expired(&self, event: &SessionExpired) {
        self(event)
    }
}

/// Delivers at most one notification per refresh generation.
///
/// Every call chain that terminates as expired after the same refresh reports
/// the same generation; only the first report reaches the observer.
pub(crate) struct ExpiryNotifier {
    observer: Option<Arc<dyn SessionObserver>>,
    last_notified: AtomicU64,
}

impl ExpiryNotifier {
    pub(crate) fn new(observer: Option<Arc<dyn SessionObserver>>) -> Self {
        Self {
            observer,
            last_notified: AtomicU64::new(0),
        }
    }

    /// Claim and deliver in one step. Returns `true` if this call delivered.
    #[cfg(test)]
    pub(crate) fn notify(&self, event: SessionExpired) -> bool {
        if !self.claim(event.generation) {
            return false;
        }
        self.deliver(&event);
        true
    }

    /// Claim the right to report `generation`. Only the first claim succeeds.
    pub(crate) fn claim(&self, generation: u64) -> bool {
        let previous = self.last_notified.fetch_max(generation, Ordering::SeqCst);
        if previous >= generation {
            debug!(generation, "Session expiry already reported");
            return false;
        }
        true
    }

    /// Hand a claimed event to the observer.
    pub(crate) fn deliver(&self, event: &SessionExpired) {
        info!(
            generation = event.generation,
            reason = ?event.reason,
            "Session expired"
        );
        if let Some(observer) = &self.observer {
            observer.session_expired(event);
        }
    }
}
