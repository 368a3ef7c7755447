//! Transport layer: endpoint descriptors and the HTTP client.

pub mod client;
pub mod endpoint;
pub mod traits;

pub use client::{HttpTransport, HttpTransportBuilder};
pub use endpoint::{Endpoint, Response};
pub use traits::Transport;
