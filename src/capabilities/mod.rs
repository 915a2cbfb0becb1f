//! Capability registry.
//!
//! Holds the last computed [`CapabilitySnapshot`]. The snapshot is derived
//! entirely from the connection table: it is recomputed whenever a backend
//! connects, disconnects or reports capabilities, and on a fixed interval.
//! Every refresh is published to subscribers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backends::{ConnectionEvent, ConnectionManager};

const UPDATE_BUFFER: usize = 16;

/// Per-backend capability sets of every connected backend plus their union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub per_backend: BTreeMap<String, BTreeSet<String>>,
    pub unified: BTreeSet<String>,
}

impl CapabilitySnapshot {
    pub fn from_sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = (String, S)>,
        S: IntoIterator<Item = String>,
    {
        let per_backend: BTreeMap<String, BTreeSet<String>> = sources
            .into_iter()
            .map(|(name, caps)| (name, caps.into_iter().collect()))
            .collect();
        let unified = per_backend.values().flatten().cloned().collect();
        Self { per_backend, unified }
    }

    pub fn for_backend(&self, backend: &str) -> Option<&BTreeSet<String>> {
        self.per_backend.get(backend)
    }
}

#[derive(Clone)]
pub struct CapabilityRegistry {
    current: Arc<RwLock<CapabilitySnapshot>>,
    updates: broadcast::Sender<CapabilitySnapshot>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self { current: Arc::new(RwLock::new(CapabilitySnapshot::default())), updates }
    }

    pub async fn snapshot(&self) -> CapabilitySnapshot {
        self.current.read().await.clone()
    }

    /// Capabilities-updated notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CapabilitySnapshot> {
        self.updates.subscribe()
    }

    /// Recompute from the connection table and publish.
    pub async fn refresh(&self, connections: &ConnectionManager) -> CapabilitySnapshot {
        let snapshot = CapabilitySnapshot::from_sources(connections.capability_sources().await);
        *self.current.write().await = snapshot.clone();
        debug!(
            backends = snapshot.per_backend.len(),
            unified = snapshot.unified.len(),
            "capabilities refreshed"
        );
        let _ = self.updates.send(snapshot.clone());
        snapshot
    }

    /// Keep the snapshot current until `shutdown` fires.
    pub fn spawn_sync(
        &self,
        connections: ConnectionManager,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        let mut events = connections.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "capability sync started");

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    event = events.recv() => match event {
                        Ok(ConnectionEvent::StateChanged { .. })
                        | Ok(ConnectionEvent::CapabilitiesReported { .. })
                        | Err(RecvError::Lagged(_)) => {
                            registry.refresh(&connections).await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Closed) => break,
                    },

                    _ = ticker.tick() => {
                        registry.refresh(&connections).await;
                    }
                }
            }
            debug!("capability sync stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_is_union_of_backends() {
        let snap = CapabilitySnapshot::from_sources(vec![
            ("alpha".to_string(), vec!["code_analysis".to_string(), "chat".to_string()]),
            ("beta".to_string(), vec!["chat".to_string(), "dreaming".to_string()]),
        ]);
        let unified: Vec<_> = snap.unified.iter().cloned().collect();
        assert_eq!(unified, vec!["chat", "code_analysis", "dreaming"]);
        assert_eq!(snap.for_backend("beta").map(|s| s.len()), Some(2));
        assert!(snap.for_backend("gamma").is_none());
    }

    #[test]
    fn empty_sources_give_empty_snapshot() {
        let snap = CapabilitySnapshot::from_sources(Vec::<(String, Vec<String>)>::new());
        assert_eq!(snap, CapabilitySnapshot::default());
    }

    #[tokio::test]
    async fn refresh_publishes_to_subscribers() {
        use crate::config::{BackendConfig, ReconnectConfig};
        use crate::health::HealthRegistry;
        use crate::metrics::Metrics;

        let connections = ConnectionManager::new(
            vec![BackendConfig::new("alpha", "127.0.0.1:1").with_capabilities(["chat"])],
            ReconnectConfig::default(),
            HealthRegistry::new(),
            Arc::new(Metrics::new()),
        );
        let registry = CapabilityRegistry::new();
        let mut updates = registry.subscribe();

        // nothing connected → nothing advertised
        let snap = registry.refresh(&connections).await;
        assert!(snap.unified.is_empty());
        assert_eq!(updates.recv().await.unwrap(), snap);
        assert_eq!(registry.snapshot().await, snap);
    }
}
