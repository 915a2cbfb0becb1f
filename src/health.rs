//! Health registry for backend connections.
//!
//! Every connection task holds a [`HealthReporter`] and writes its state on
//! each transition (connected, closed, connect failure, gave up). The
//! [`HealthRegistry`] keeps the last state per backend and hands out a
//! snapshot on demand, so health reads never touch the network.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Last reported state of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend: String,
    pub healthy: bool,
    pub message: String,
    /// Endpoint of the last connect attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Consecutive failed attempts; 0 while connected.
    #[serde(default)]
    pub attempt: u32,
}

impl BackendHealth {
    pub fn connected(backend: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            healthy: true,
            message: "connected".into(),
            endpoint: Some(endpoint.into()),
            attempt: 0,
        }
    }

    pub fn down(backend: impl Into<String>, endpoint: Option<String>, attempt: u32, message: impl Into<String>) -> Self {
        Self { backend: backend.into(), healthy: false, message: message.into(), endpoint, attempt }
    }
}

/// Shared, cheaply clonable table of per-backend health.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<HashMap<String, BackendHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reporter(&self, backend: impl Into<String>) -> HealthReporter {
        HealthReporter { backend: backend.into(), registry: self.clone() }
    }

    /// All states, sorted by backend name.
    pub async fn snapshot(&self) -> Vec<BackendHealth> {
        let map = self.inner.read().await;
        let mut v: Vec<_> = map.values().cloned().collect();
        v.sort_by(|a, b| a.backend.cmp(&b.backend));
        v
    }

    /// `true` when nothing has reported or every backend is healthy.
    pub async fn all_healthy(&self) -> bool {
        self.inner.read().await.values().all(|h| h.healthy)
    }

    pub async fn get(&self, backend: &str) -> Option<BackendHealth> {
        self.inner.read().await.get(backend).cloned()
    }
}

/// Write handle for a single backend.
#[derive(Clone)]
pub struct HealthReporter {
    backend: String,
    registry: HealthRegistry,
}

impl HealthReporter {
    pub async fn set_connected(&self, endpoint: &str) {
        self.write(BackendHealth::connected(&self.backend, endpoint)).await;
    }

    /// `attempt` is the failure count after this failure.
    pub async fn set_down(&self, endpoint: Option<&str>, attempt: u32, message: impl Into<String>) {
        self.write(BackendHealth::down(&self.backend, endpoint.map(str::to_string), attempt, message)).await;
    }

    async fn write(&self, h: BackendHealth) {
        self.registry.inner.write().await.insert(self.backend.clone(), h);
    }
}
