#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use authpipe::error::TransportError;
use authpipe::session::{CachedCredentialStore, MemorySecureStorage};
use authpipe::{Credential, Endpoint, RequestPipeline, Response, SessionExpired, Transport};

pub const REFRESH_PATH: &str = "/oauth/token";
pub const API_PATH: &str = "/api/profile";

/// How the fake token endpoint answers.
#[derive(Debug, Clone)]
pub enum RefreshBehavior {
    /// Issue this access token.
    Grant(&'static str),
    /// Fail with a connectivity error.
    NetworkDown,
    /// Answer 400 `invalid_grant`.
    Reject,
}

/// One request seen by [`FakeServer`].
#[derive(Debug, Clone)]
pub struct Seen {
    pub path: String,
    pub authorization: Option<String>,
    pub call: Option<String>,
}

/// In-process server: `API_PATH` accepts only the current `accepted` token.
pub struct FakeServer {
    pub refresh: RefreshBehavior,
    pub accepted: Mutex<Option<String>>,
    /// Hold the refresh response until this many API rejections were served.
    pub hold_refresh_until: usize,
    /// Latency of the token endpoint.
    pub refresh_delay: Duration,
    /// Latency of API calls whose call id starts with `slow`.
    pub slow_call_delay: Duration,
    rejections: AtomicUsize,
    seen: Mutex<Vec<Seen>>,
}

impl FakeServer {
    fn base(refresh: RefreshBehavior, accepted: Option<&str>) -> Self {
        Self {
            refresh,
            accepted: Mutex::new(accepted.map(str::to_string)),
            hold_refresh_until: 0,
            refresh_delay: Duration::ZERO,
            slow_call_delay: Duration::ZERO,
            rejections: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn new(refresh: RefreshBehavior, accepted: Option<&str>) -> Arc<Self> {
        Arc::new(Self::base(refresh, accepted))
    }

    pub fn holding(refresh: RefreshBehavior, accepted: Option<&str>, until: usize) -> Arc<Self> {
        Arc::new(Self {
            hold_refresh_until: until,
            ..Self::base(refresh, accepted)
        })
    }

    /// Rejections arrive spread out in time: `slow*` calls are answered after
    /// `slow_call_delay`, the token endpoint after `refresh_delay`.
    pub fn staggered(
        refresh: RefreshBehavior,
        accepted: Option<&str>,
        refresh_delay: Duration,
        slow_call_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            refresh_delay,
            slow_call_delay,
            ..Self::base(refresh, accepted)
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.seen().iter().filter(|s| s.path == path).count()
    }

    pub fn api_calls_for(&self, call: &str) -> usize {
        self.seen()
            .iter()
            .filter(|s| s.path == API_PATH && s.call.as_deref() == Some(call))
            .count()
    }

    async fn answer_refresh(&self) -> Result<Response, TransportError> {
        if self.hold_refresh_until > 0 {
            while self.rejections.load(Ordering::SeqCst) < self.hold_refresh_until {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            // Let the last rejected caller reach the shared refresh.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(self.refresh_delay).await;
        match &self.refresh {
            RefreshBehavior::Grant(token) => Ok(Response::new(
                200,
                format!(r#"{{"access_token":"{token}","token_type":"Bearer","expires_in":3600}}"#),
            )),
            RefreshBehavior::NetworkDown => {
                Err(TransportError::Connectivity("token host unreachable".into()))
            }
            RefreshBehavior::Reject => Err(TransportError::Status {
                status: 400,
                body: r#"{"error":"invalid_grant"}"#.into(),
            }),
        }
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, endpoint: &Endpoint) -> Result<Response, TransportError> {
        let authorization = endpoint.header("Authorization").map(str::to_string);
        let call = endpoint.header("X-Call").map(str::to_string);
        self.seen.lock().unwrap().push(Seen {
            path: endpoint.path().to_string(),
            authorization: authorization.clone(),
            call: call.clone(),
        });
        if call.as_deref().is_some_and(|c| c.starts_with("slow")) {
            tokio::time::sleep(self.slow_call_delay).await;
        }

        match endpoint.path() {
            REFRESH_PATH => self.answer_refresh().await,
            API_PATH => {
                let accepted = self.accepted.lock().unwrap().clone();
                let ok = matches!(
                    (&authorization, &accepted),
                    (Some(auth), Some(token)) if *auth == format!("Bearer {token}")
                );
                if ok {
                    Ok(Response::new(200, r#"{"id":7,"name":"ada"}"#))
                } else {
                    self.rejections.fetch_add(1, Ordering::SeqCst);
                    Err(TransportError::Status {
                        status: 401,
                        body: String::new(),
                    })
                }
            }
            _ => Err(TransportError::Status {
                status: 404,
                body: "no such route".into(),
            }),
        }
    }
}

/// Counts observer deliveries.
#[derive(Clone, Default)]
pub struct Expiries(pub Arc<Mutex<Vec<SessionExpired>>>);

impl Expiries {
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<SessionExpired> {
        self.0.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub server: Arc<FakeServer>,
    pub storage: MemorySecureStorage,
    pub expiries: Expiries,
    pub pipeline: Arc<RequestPipeline>,
}

/// Pipeline over `server`, signed in with access token `stale`.
pub fn harness(server: Arc<FakeServer>) -> Harness {
    let storage = MemorySecureStorage::new();
    let expiries = Expiries::default();
    let sink = expiries.clone();
    let pipeline = RequestPipeline::builder()
        .transport_arc(server.clone())
        .store(CachedCredentialStore::new(storage.clone()))
        .observer(move |event: &SessionExpired| sink.0.lock().unwrap().push(event.clone()))
        .build();
    pipeline
        .sign_in(Credential::new("stale", "refresh-1"))
        .unwrap();
    Harness {
        server,
        storage,
        expiries,
        pipeline: Arc::new(pipeline),
    }
}

/// Factory for `API_PATH` tagged with a call id.
pub fn profile(call: &str) -> impl Fn(&Credential) -> Result<Endpoint, std::convert::Infallible> + '_ {
    move |credential| {
        Ok(Endpoint::get(API_PATH)
            .with_bearer(credential)
            .with_header("X-Call", call))
    }
}
