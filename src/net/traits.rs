//! Networking traits.

use async_trait::async_trait;

use super::endpoint::{Endpoint, Response};
use crate::error::TransportError;

/// Performs a single request/response cycle.
///
/// Implementations never retry; retry decisions belong to
/// [`RequestPipeline`](crate::pipeline::RequestPipeline).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `endpoint` and return the response for any 2xx/3xx status.
    ///
    /// Non-success statuses are reported as [`TransportError::Status`].
    async fn send(&self, endpoint: &Endpoint) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, endpoint: &Endpoint) -> Result<Response, TransportError> {
        (**self).send(endpoint).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, endpoint: &Endpoint) -> Result<Response, TransportError> {
        (**self).send(endpoint).await
    }
}
