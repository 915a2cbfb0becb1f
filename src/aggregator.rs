//! Aggregator facade.
//!
//! Owns the connection manager, capability registry, router, dispatcher and
//! synthesizer behind an explicit lifecycle:
//!
//! ```text
//! Created ──initialize()──▶ Running ──shutdown()──▶ Stopped
//! ```
//!
//! `initialize` is idempotent while running. Once stopped the aggregator
//! cannot be restarted; build a new one instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{BackendStatus, ConnectionManager};
use crate::capabilities::{CapabilityRegistry, CapabilitySnapshot};
use crate::config::AggregatorConfig;
use crate::core::error::AggregatorError;
use crate::dispatch::{
    BackendOutcome, DispatchSettings, Dispatcher, RequestHandle, StreamChunk, StreamedResponse,
};
use crate::health::{BackendHealth, HealthRegistry};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::router::Router;
use crate::synth::{AggregatedResponse, Synthesizer};

enum Lifecycle {
    Created,
    Running { dispatcher: Dispatcher, tasks: Vec<JoinHandle<()>> },
    Stopped,
}

struct Inner {
    config: AggregatorConfig,
    connections: ConnectionManager,
    capabilities: CapabilityRegistry,
    health: HealthRegistry,
    metrics: Arc<Metrics>,
    router: Router,
    synth: Synthesizer,
    shutdown: CancellationToken,
    lifecycle: RwLock<Lifecycle>,
    /// Serialises `initialize` calls; `lifecycle` is only locked briefly.
    starting: Mutex<()>,
}

/// Cheap to clone; every clone drives the same aggregator.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

/// A unary request in flight. Resolves to the synthesized answer.
pub struct PendingChat {
    handle: RequestHandle<Vec<BackendOutcome>>,
    synth: Synthesizer,
}

impl PendingChat {
    pub fn correlation_id(&self) -> &str {
        self.handle.correlation_id()
    }

    pub async fn wait(self) -> Result<AggregatedResponse, AggregatorError> {
        let outcomes = self.handle.wait().await?;
        Ok(self.synth.synthesize(&outcomes))
    }
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let health = HealthRegistry::new();
        let metrics = Arc::new(Metrics::new());
        let connections = ConnectionManager::new(
            config.backends.clone(),
            config.reconnect.clone(),
            health.clone(),
            metrics.clone(),
        );
        let router = Router::new(&config.backends, config.dispatch.enable_parallel_processing);
        let synth = Synthesizer::new(config.dispatch.enable_response_synthesis);

        Self {
            inner: Arc::new(Inner {
                config,
                connections,
                capabilities: CapabilityRegistry::new(),
                health,
                metrics,
                router,
                synth,
                shutdown: CancellationToken::new(),
                lifecycle: RwLock::new(Lifecycle::Created),
                starting: Mutex::new(()),
            }),
        }
    }

    /// Discover endpoints, connect every backend, take the first capability
    /// snapshot and start the periodic sync.
    ///
    /// Returns once every backend has made its first connect attempt. A
    /// backend that is down at startup keeps retrying in the background.
    /// Until then the aggregator reports itself as not running, and requests
    /// fail with `Shutdown` instead of waiting.
    pub async fn initialize(&self) -> Result<(), AggregatorError> {
        let _starting = self.inner.starting.lock().await;
        match *self.inner.lifecycle.read().await {
            Lifecycle::Running { .. } => {
                debug!("aggregator already initialised");
                return Ok(());
            }
            Lifecycle::Stopped => return Err(AggregatorError::Shutdown),
            Lifecycle::Created => {}
        }

        let config = &self.inner.config;
        if config.discovery.skip {
            debug!("endpoint discovery skipped");
        } else {
            let timeout = Duration::from_millis(config.discovery.probe_timeout_ms);
            self.inner.connections.discover(timeout).await;
        }

        let (dispatcher, correlator) = Dispatcher::spawn(
            DispatchSettings::from(&config.dispatch),
            self.inner.connections.clone(),
            self.inner.metrics.clone(),
            self.inner.shutdown.clone(),
        );

        let mut tasks = self
            .inner
            .connections
            .start(Arc::new(dispatcher.inbox()), self.inner.shutdown.clone())
            .await;
        tasks.push(correlator);

        self.inner.capabilities.refresh(&self.inner.connections).await;
        tasks.push(self.inner.capabilities.spawn_sync(
            self.inner.connections.clone(),
            Duration::from_secs(config.capability_sync_interval_secs.max(1)),
            self.inner.shutdown.clone(),
        ));

        let status = self.inner.connections.connection_status().await;
        let connected = status.values().filter(|up| **up).count();

        let mut lifecycle = self.inner.lifecycle.write().await;
        if matches!(*lifecycle, Lifecycle::Stopped) {
            // shut down while starting; the token is already cancelled
            drop(lifecycle);
            dispatcher.shutdown();
            for task in tasks {
                let _ = task.await;
            }
            return Err(AggregatorError::Shutdown);
        }
        *lifecycle = Lifecycle::Running { dispatcher, tasks };
        info!(backends = status.len(), connected, "aggregator initialised");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.inner.lifecycle.read().await, Lifecycle::Running { .. })
    }

    async fn dispatcher(&self) -> Result<Dispatcher, AggregatorError> {
        match &*self.inner.lifecycle.read().await {
            Lifecycle::Running { dispatcher, .. } => Ok(dispatcher.clone()),
            _ => Err(AggregatorError::Shutdown),
        }
    }

    async fn route(&self, message: &str) -> Result<Vec<String>, AggregatorError> {
        let status = self.inner.connections.connection_status().await;
        let targets = self.inner.router.route(message, &status);
        if targets.is_empty() {
            warn!("no backend connected, rejecting request");
            return Err(AggregatorError::NoBackendAvailable);
        }
        debug!(targets = ?targets, "request routed");
        Ok(targets)
    }

    /// Route and send `message` without waiting for the answer. The returned
    /// handle's correlation id can be passed to [`Aggregator::cancel`].
    pub async fn submit_unary(&self, message: &str) -> Result<PendingChat, AggregatorError> {
        let dispatcher = self.dispatcher().await?;
        let targets = self.route(message).await?;
        let handle = dispatcher.dispatch_unary(message, targets).await?;
        Ok(PendingChat { handle, synth: self.inner.synth })
    }

    /// Fan `message` out, wait for every target to settle, and synthesize.
    ///
    /// Individual backend failures are folded into the answer; only a
    /// timeout, an empty route, cancellation or shutdown surface as `Err`.
    pub async fn dispatch_unary(&self, message: &str) -> Result<AggregatedResponse, AggregatorError> {
        self.submit_unary(message).await?.wait().await
    }

    /// Like [`Aggregator::dispatch_streaming`] but returns as soon as the
    /// request is sent.
    pub async fn submit_streaming<F>(
        &self,
        message: &str,
        on_chunk: F,
    ) -> Result<RequestHandle<StreamedResponse>, AggregatorError>
    where
        F: FnMut(StreamChunk) + Send + 'static,
    {
        let dispatcher = self.dispatcher().await?;
        let targets = self.route(message).await?;
        dispatcher.dispatch_streaming(message, targets, Some(Box::new(on_chunk))).await
    }

    /// Stream `message` from every routed backend. `on_chunk` sees each piece
    /// as it arrives; the result holds the buffers of the backends that
    /// finished, in priority order, or the fallback text when none did.
    pub async fn dispatch_streaming<F>(&self, message: &str, on_chunk: F) -> Result<StreamedResponse, AggregatorError>
    where
        F: FnMut(StreamChunk) + Send + 'static,
    {
        self.submit_streaming(message, on_chunk).await?.wait().await
    }

    /// `false` when the request already finished or was never pending.
    pub async fn cancel(&self, correlation_id: &str) -> bool {
        match self.dispatcher().await {
            Ok(d) => d.cancel(correlation_id).await,
            Err(_) => false,
        }
    }

    /// Backend name → connected, for every configured backend.
    pub async fn connection_status(&self) -> BTreeMap<String, bool> {
        self.inner.connections.connection_status().await
    }

    /// Per-backend connection state in priority order.
    pub async fn status(&self) -> Vec<BackendStatus> {
        self.inner.connections.status().await
    }

    pub async fn capabilities(&self) -> CapabilitySnapshot {
        self.inner.capabilities.snapshot().await
    }

    pub fn subscribe_capabilities(&self) -> broadcast::Receiver<CapabilitySnapshot> {
        self.inner.capabilities.subscribe()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let status = self.inner.connections.connection_status().await;
        let connected = status.values().filter(|up| **up).count();
        let pending = match self.dispatcher().await {
            Ok(d) => d.pending_count().await,
            Err(_) => 0,
        };
        self.inner.metrics.snapshot(connected, pending)
    }

    pub async fn health(&self) -> Vec<BackendHealth> {
        self.inner.health.snapshot().await
    }

    /// Stop every task and fail outstanding requests with `Shutdown`.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let previous = {
            let mut lifecycle = self.inner.lifecycle.write().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };
        self.inner.shutdown.cancel();

        if let Lifecycle::Running { dispatcher, tasks } = previous {
            dispatcher.shutdown();
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "aggregator task ended abnormally");
                }
            }
            info!("aggregator stopped");
        }
    }
}
