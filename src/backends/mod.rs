//! Connection manager.
//!
//! Owns one persistent length-delimited TCP channel per configured backend.
//! Each channel is driven by its own task (see `connection`), which is the
//! only writer of that backend's slot in the shared table. Everyone else
//! reads the table through [`ConnectionManager`] or follows the
//! [`ConnectionEvent`] broadcast.
//!
//! The manager never touches the pending-request table. Inbound frames are
//! handed to a [`FrameSink`], which the dispatcher implements.

pub mod backoff;
mod connection;
pub mod discovery;
pub mod wire;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{BackendConfig, ReconnectConfig};
use crate::core::error::AggregatorError;
use crate::health::HealthRegistry;
use crate::metrics::Metrics;

pub use backoff::{BackoffPolicy, Clock, ManualClock, RetryState, RetryTracker, TokioClock};
pub use wire::{BackendReply, FrameBody, InboundFrame};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connectivity notifications published by the connection tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged { backend: String, state: ConnectionState, attempt: u32 },
    RetryScheduled { backend: String, attempt: u32, delay: Duration },
    GaveUp { backend: String, attempts: u32 },
    CapabilitiesReported { backend: String, capabilities: Vec<String> },
}

/// Receiver of parsed inbound frames.
pub trait FrameSink: Send + Sync + 'static {
    fn deliver(&self, backend: &str, frame: InboundFrame);

    /// The backend's channel closed; its unfinished request legs cannot
    /// complete any more.
    fn backend_lost(&self, backend: &str);
}

/// Read-only view of one backend for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub endpoint: String,
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
}

struct Slot {
    config: BackendConfig,
    endpoint: String,
    state: ConnectionState,
    reconnect_attempt: u32,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    reported_capabilities: Option<Vec<String>>,
}

struct Inner {
    order: Vec<String>,
    slots: RwLock<HashMap<String, Slot>>,
    events: broadcast::Sender<ConnectionEvent>,
    reconnect: ReconnectConfig,
    clock: Arc<dyn Clock>,
    health: HealthRegistry,
    metrics: Arc<Metrics>,
}

/// Clone freely; all clones share the same table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        backends: Vec<BackendConfig>,
        reconnect: ReconnectConfig,
        health: HealthRegistry,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_clock(backends, reconnect, health, metrics, Arc::new(TokioClock))
    }

    pub fn with_clock(
        backends: Vec<BackendConfig>,
        reconnect: ReconnectConfig,
        health: HealthRegistry,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let order = backends.iter().map(|b| b.name.clone()).collect();
        let slots = backends
            .into_iter()
            .map(|config| {
                let slot = Slot {
                    endpoint: config.endpoint.clone(),
                    config,
                    state: ConnectionState::Disconnected,
                    reconnect_attempt: 0,
                    outbound: None,
                    reported_capabilities: None,
                };
                (slot.config.name.clone(), slot)
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                order,
                slots: RwLock::new(slots),
                events,
                reconnect,
                clock,
                health,
                metrics,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Probe every backend's candidate endpoints concurrently and adopt the
    /// first that answers.
    pub async fn discover(&self, probe_timeout: Duration) {
        let configs: Vec<BackendConfig> = {
            let slots = self.inner.slots.read().await;
            self.inner.order.iter().filter_map(|n| slots.get(n)).map(|s| s.config.clone()).collect()
        };
        let found = futures::future::join_all(
            configs.iter().map(|c| discovery::discover(c, probe_timeout)),
        )
        .await;

        let mut slots = self.inner.slots.write().await;
        for (config, endpoint) in configs.iter().zip(found) {
            if let Some(slot) = slots.get_mut(&config.name) {
                slot.endpoint = endpoint;
            }
        }
    }

    /// Spawn one connection task per backend and wait until each has made its
    /// first connect attempt.
    pub async fn start(&self, sink: Arc<dyn FrameSink>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let policy = BackoffPolicy::from_config(&self.inner.reconnect);
        let connect_timeout = Duration::from_millis(self.inner.reconnect.connect_timeout_ms);

        let mut handles = Vec::with_capacity(self.inner.order.len());
        let mut first_attempts = Vec::with_capacity(self.inner.order.len());
        for name in &self.inner.order {
            let (first_tx, first_rx) = oneshot::channel();
            let task = connection::ConnectionTask {
                backend: name.clone(),
                manager: self.clone(),
                sink: sink.clone(),
                tracker: RetryTracker::new(policy, self.inner.clock.clone()),
                connect_timeout,
                health: self.inner.health.reporter(name.clone()),
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(task.run(first_tx)));
            first_attempts.push(first_rx);
        }
        // A dropped sender means the task exited early; nothing to wait for.
        futures::future::join_all(first_attempts).await;
        info!(backends = self.inner.order.len(), "connection tasks started");
        handles
    }

    /// Queue `payload` on `backend`'s channel. Fails fast when the backend is
    /// not connected.
    pub async fn send(&self, backend: &str, payload: Bytes) -> Result<(), AggregatorError> {
        let unavailable = || AggregatorError::ConnectionUnavailable { backend: backend.to_string() };
        let slots = self.inner.slots.read().await;
        let slot = slots.get(backend).ok_or_else(unavailable)?;
        match (&slot.state, &slot.outbound) {
            (ConnectionState::Connected, Some(tx)) => tx.send(payload).map_err(|_| unavailable()),
            _ => Err(unavailable()),
        }
    }

    /// Backend name → connected, for every configured backend.
    pub async fn connection_status(&self) -> BTreeMap<String, bool> {
        let slots = self.inner.slots.read().await;
        slots
            .iter()
            .map(|(name, s)| (name.clone(), s.state == ConnectionState::Connected))
            .collect()
    }

    pub async fn status(&self) -> Vec<BackendStatus> {
        let slots = self.inner.slots.read().await;
        self.inner
            .order
            .iter()
            .filter_map(|n| slots.get(n))
            .map(|s| BackendStatus {
                name: s.config.name.clone(),
                endpoint: s.endpoint.clone(),
                state: s.state,
                reconnect_attempt: s.reconnect_attempt,
            })
            .collect()
    }

    pub async fn state(&self, backend: &str) -> Option<ConnectionState> {
        self.inner.slots.read().await.get(backend).map(|s| s.state)
    }

    pub async fn reconnect_attempt(&self, backend: &str) -> Option<u32> {
        self.inner.slots.read().await.get(backend).map(|s| s.reconnect_attempt)
    }

    /// Capability list of every connected backend, priority order. A report
    /// received on the current connection wins over the configured list.
    pub async fn capability_sources(&self) -> Vec<(String, Vec<String>)> {
        let slots = self.inner.slots.read().await;
        self.inner
            .order
            .iter()
            .filter_map(|n| slots.get(n))
            .filter(|s| s.state == ConnectionState::Connected)
            .map(|s| {
                let caps = s
                    .reported_capabilities
                    .clone()
                    .unwrap_or_else(|| s.config.capabilities.clone());
                (s.config.name.clone(), caps)
            })
            .collect()
    }

    // ── connection-task side ─────────────────────────────────────────────────

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    async fn endpoint(&self, backend: &str) -> Option<String> {
        self.inner.slots.read().await.get(backend).map(|s| s.endpoint.clone())
    }

    async fn mark_connecting(&self, backend: &str) {
        let attempt = {
            let mut slots = self.inner.slots.write().await;
            let Some(slot) = slots.get_mut(backend) else { return };
            slot.state = ConnectionState::Connecting;
            slot.reconnect_attempt
        };
        self.emit(ConnectionEvent::StateChanged {
            backend: backend.to_string(),
            state: ConnectionState::Connecting,
            attempt,
        });
    }

    async fn mark_connected(&self, backend: &str, outbound: mpsc::UnboundedSender<Bytes>) {
        {
            let mut slots = self.inner.slots.write().await;
            let Some(slot) = slots.get_mut(backend) else { return };
            slot.state = ConnectionState::Connected;
            slot.reconnect_attempt = 0;
            slot.outbound = Some(outbound);
            slot.reported_capabilities = None;
        }
        self.emit(ConnectionEvent::StateChanged {
            backend: backend.to_string(),
            state: ConnectionState::Connected,
            attempt: 0,
        });
    }

    /// Returns `true` if the backend was connected before this call.
    async fn mark_disconnected(&self, backend: &str, attempt: u32) -> bool {
        let was_connected = {
            let mut slots = self.inner.slots.write().await;
            let Some(slot) = slots.get_mut(backend) else { return false };
            let was = slot.state == ConnectionState::Connected;
            slot.state = ConnectionState::Disconnected;
            slot.reconnect_attempt = attempt;
            slot.outbound = None;
            slot.reported_capabilities = None;
            was
        };
        self.emit(ConnectionEvent::StateChanged {
            backend: backend.to_string(),
            state: ConnectionState::Disconnected,
            attempt,
        });
        was_connected
    }

    async fn record_capabilities(&self, backend: &str, capabilities: Vec<String>) {
        {
            let mut slots = self.inner.slots.write().await;
            let Some(slot) = slots.get_mut(backend) else { return };
            slot.reported_capabilities = Some(capabilities.clone());
        }
        debug!(backend = %backend, count = capabilities.len(), "capabilities reported");
        self.emit(ConnectionEvent::CapabilitiesReported { backend: backend.to_string(), capabilities });
    }
}
