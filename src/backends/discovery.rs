//! One-shot startup endpoint discovery.
//!
//! Each backend's candidate list is probed in order with a plain TCP connect
//! bounded by the probe timeout. The first candidate that accepts is adopted;
//! when none does, the configured endpoint is kept.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::BackendConfig;

/// Accepts `host:port` or `tcp://host:port`.
pub fn socket_addr(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint).trim_end_matches('/')
}

/// `true` if a TCP connection to `endpoint` completes within `timeout`.
pub async fn probe(endpoint: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(socket_addr(endpoint))).await,
        Ok(Ok(_))
    )
}

/// Endpoint to use for `backend`: the first answering candidate, else the
/// configured endpoint.
pub async fn discover(backend: &BackendConfig, timeout: Duration) -> String {
    for candidate in &backend.candidate_endpoints {
        if probe(candidate, timeout).await {
            info!(backend = %backend.name, endpoint = %candidate, "discovered backend endpoint");
            return candidate.clone();
        }
        debug!(backend = %backend.name, endpoint = %candidate, "candidate did not answer");
    }
    backend.endpoint.clone()
}
