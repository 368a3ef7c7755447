//! `reqwest`-backed [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use tracing::debug;

use super::endpoint::{Endpoint, Response};
use super::traits::Transport;
use crate::config::TransportConfig;
use crate::error::TransportError;

/// Default user agent for the library.
pub const USER_AGENT: &str = concat!("authpipe/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP transport with a standard configuration (User-Agent, timeouts, base URL).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    inner: Client,
    base_url: Option<String>,
}

impl HttpTransport {
    /// Create a transport with default settings and no base URL.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::default()
    }

    /// Create a transport from the `[transport]` config section.
    pub fn from_config(config: &TransportConfig) -> Self {
        let mut builder = Self::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .request_timeout(Duration::from_secs(config.request_timeout_secs));
        if let Some(base) = &config.base_url {
            builder = builder.base_url(base);
        }
        builder.build()
    }

    /// Get the inner reqwest client.
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Resolve an endpoint path against the base URL.
    fn resolve(&self, path: &str) -> Result<String, TransportError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path.to_string());
        }
        let base = self.base_url.as_deref().ok_or_else(|| {
            TransportError::Other(format!("Relative path '{path}' without a base URL"))
        })?;
        let base = base.trim_end_matches('/');
        if path.starts_with('/') {
            Ok(format!("{base}{path}"))
        } else {
            Ok(format!("{base}/{path}"))
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &Endpoint) -> Result<Response, TransportError> {
        let url = self.resolve(endpoint.path())?;

        let mut request = self.inner.request(endpoint.method().clone(), &url);
        for (name, value) in endpoint.headers() {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = endpoint.body() {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect::<Vec<_>>();
        // No content decoding is enabled, so a failed body read is a broken
        // connection whatever kind reqwest gives it.
        let body = response.bytes().await.map_err(|e| match TransportError::from(e) {
            TransportError::Decode(detail) => TransportError::Connectivity(detail),
            other => other,
        })?;

        debug!(
            method = %endpoint.method(),
            %url,
            status = status.as_u16(),
            bytes = body.len(),
            "Transport round trip"
        );

        if !status.is_success() && !status.is_redirection() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let mut out = Response::new(status.as_u16(), body);
        for (name, value) in headers {
            out = out.with_header(name, value);
        }

        if endpoint.expects_body() && out.is_empty() {
            return Err(TransportError::EmptyBody);
        }

        Ok(out)
    }
}

/// Builder for [`HttpTransport`].
pub struct HttpTransportBuilder {
    builder: ClientBuilder,
    base_url: Option<String>,
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self {
            builder: Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT),
            base_url: None,
        }
    }
}

impl HttpTransportBuilder {
    /// Set a custom user agent.
    pub fn user_agent(mut self, ua: &str) -> Self {
        self.builder = self.builder.user_agent(ua);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.connect_timeout(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.timeout(timeout);
        self
    }

    /// Base URL that relative endpoint paths are appended to.
    pub fn base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = Some(base.into());
        self
    }

    /// Build the transport.
    pub fn build(self) -> HttpTransport {
        let inner = match self.builder.build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to build HTTP client with custom config: {}; using defaults", e);
                Client::default()
            }
        };
        HttpTransport {
            inner,
            base_url: self.base_url,
        }
    }
}
