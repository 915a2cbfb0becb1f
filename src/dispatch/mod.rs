//! Dispatcher and correlator.
//!
//! [`Dispatcher`] is the client handle: it assigns the correlation id,
//! registers the request with the correlator actor, then fans the
//! `chat_message` frame out to every target. Registration is sent before any
//! backend sees the frame, so a reply can never reach the correlator ahead
//! of its own request.

pub mod correlation;
mod correlator;
mod pending;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backends::wire::OutboundFrame;
use crate::backends::{BackendReply, ConnectionManager, FrameSink, InboundFrame};
use crate::config::DispatchConfig;
use crate::core::error::AggregatorError;
use crate::metrics::Metrics;
use crate::synth::{FALLBACK_TEXT, ResponseKind};

use correlator::{Correlator, CorrelatorMsg};
use pending::{PendingRequest, Shape};

/// One piece of a streamed answer, delivered as it arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub correlation_id: String,
    pub backend: String,
    pub content: String,
}

/// Invoked on the correlator task for every chunk; keep it short.
pub type ChunkCallback = Box<dyn FnMut(StreamChunk) + Send + 'static>;

/// Settled result of one backend leg.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutcome {
    pub backend: String,
    pub result: Result<BackendReply, AggregatorError>,
}

/// Final value of a streaming request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamedResponse {
    pub correlation_id: String,
    /// `fallback_response` when no stream finished, otherwise unified for a
    /// single source and synthesized for several.
    pub kind: ResponseKind,
    /// Buffers of the finished backends in priority order, separated by a
    /// blank line. [`FALLBACK_TEXT`] when none finished.
    pub text: String,
    pub sources: Vec<String>,
    pub capabilities: Vec<String>,
    /// Backends whose stream failed, with the reason.
    pub failures: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub response_timeout: Duration,
    pub legacy_uncorrelated_fallback: bool,
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(c: &DispatchConfig) -> Self {
        Self {
            response_timeout: c.response_timeout(),
            legacy_uncorrelated_fallback: c.legacy_uncorrelated_fallback,
        }
    }
}

/// Awaitable handle to a registered request. Unary requests resolve to one
/// outcome per target in priority order; streaming requests to a
/// [`StreamedResponse`].
pub struct RequestHandle<T> {
    correlation_id: String,
    rx: oneshot::Receiver<Result<T, AggregatorError>>,
}

impl<T> RequestHandle<T> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn wait(self) -> Result<T, AggregatorError> {
        self.rx.await.unwrap_or(Err(AggregatorError::Shutdown))
    }
}

/// Frame sink handed to the connection tasks.
#[derive(Clone)]
pub struct CorrelatorInbox {
    tx: mpsc::UnboundedSender<CorrelatorMsg>,
}

impl FrameSink for CorrelatorInbox {
    fn deliver(&self, backend: &str, frame: InboundFrame) {
        let _ = self.tx.send(CorrelatorMsg::Inbound { backend: backend.to_string(), frame });
    }

    fn backend_lost(&self, backend: &str) {
        let _ = self.tx.send(CorrelatorMsg::BackendLost { backend: backend.to_string() });
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<CorrelatorMsg>,
    connections: ConnectionManager,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// Spawn the correlator actor. It runs until `shutdown` fires or
    /// [`Dispatcher::shutdown`] is called, then fails every pending request
    /// with `Shutdown`.
    pub fn spawn(
        settings: DispatchSettings,
        connections: ConnectionManager,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Correlator::new(rx, settings, metrics.clone(), shutdown);
        let handle = tokio::spawn(actor.run());
        (Self { tx, connections, metrics }, handle)
    }

    pub fn inbox(&self) -> CorrelatorInbox {
        CorrelatorInbox { tx: self.tx.clone() }
    }

    pub async fn dispatch_unary(
        &self,
        message: &str,
        targets: Vec<String>,
    ) -> Result<RequestHandle<Vec<BackendOutcome>>, AggregatorError> {
        let (done, rx) = oneshot::channel();
        let correlation_id = self.dispatch(message, targets, Shape::Unary { done }).await?;
        Ok(RequestHandle { correlation_id, rx })
    }

    pub async fn dispatch_streaming(
        &self,
        message: &str,
        targets: Vec<String>,
        on_chunk: Option<ChunkCallback>,
    ) -> Result<RequestHandle<StreamedResponse>, AggregatorError> {
        let (done, rx) = oneshot::channel();
        let correlation_id = self.dispatch(message, targets, Shape::Streaming { on_chunk, done }).await?;
        Ok(RequestHandle { correlation_id, rx })
    }

    /// Register a request for `targets` and send it to each of them.
    ///
    /// A target that is not connected settles immediately as a failed leg;
    /// the request itself only fails on an empty target list or when the
    /// correlator is gone.
    async fn dispatch(&self, message: &str, targets: Vec<String>, shape: Shape) -> Result<String, AggregatorError> {
        if targets.is_empty() {
            return Err(AggregatorError::NoBackendAvailable);
        }

        let correlation_id = correlation::generate();
        let payload = OutboundFrame::chat(message, correlation_id.clone()).encode()?;

        let entry = PendingRequest::new(correlation_id.clone(), targets.clone(), shape);
        self.tx.send(CorrelatorMsg::Register(entry)).map_err(|_| AggregatorError::Shutdown)?;
        self.metrics.record_dispatched();

        for backend in targets {
            match self.connections.send(&backend, payload.clone()).await {
                Ok(()) => debug!(backend = %backend, correlation_id = %correlation_id, "request sent"),
                Err(error) => {
                    warn!(backend = %backend, correlation_id = %correlation_id, error = %error, "send failed");
                    let _ = self.tx.send(CorrelatorMsg::LegFailed {
                        correlation_id: correlation_id.clone(),
                        backend,
                        error,
                    });
                }
            }
        }

        Ok(correlation_id)
    }

    /// Resolve `correlation_id` with `Cancelled`. `false` if it was no longer
    /// pending.
    pub async fn cancel(&self, correlation_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let msg = CorrelatorMsg::Cancel { correlation_id: correlation_id.to_string(), reply };
        if self.tx.send(msg).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn pending_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CorrelatorMsg::PendingCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_pending(&self, correlation_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let msg = CorrelatorMsg::IsPending { correlation_id: correlation_id.to_string(), reply };
        if self.tx.send(msg).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop the correlator; pending callers receive `Shutdown`.
    pub fn shutdown(&self) {
        let _ = self.tx.send(CorrelatorMsg::Shutdown);
    }
}
