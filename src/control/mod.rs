//! Control plane.
//!
//! A small command set served by one control task that owns an
//! [`Aggregator`] handle. Transport adapters (the Unix socket in [`uds`])
//! only parse and forward; they never touch the aggregator directly.

pub mod uds;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::backends::BackendStatus;
use crate::capabilities::CapabilitySnapshot;
use crate::health::BackendHealth;
use crate::metrics::MetricsSnapshot;
use crate::synth::AggregatedResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Health,
    Status,
    Capabilities,
    Metrics,
    Chat { message: String },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Health { healthy: bool, backends: Vec<BackendHealth> },
    Status { uptime_ms: u64, backends: Vec<BackendStatus> },
    Capabilities(CapabilitySnapshot),
    Metrics(MetricsSnapshot),
    Chat(AggregatedResponse),
    Ack { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlError {
    /// The command could not be parsed or is not allowed right now.
    Invalid { message: String },
    /// The aggregator rejected the request.
    Request { message: String },
}

pub type ControlResult = Result<ControlResponse, ControlError>;

#[derive(Debug)]
struct ControlMessage {
    command: ControlCommand,
    reply_tx: oneshot::Sender<ControlResult>,
}

/// Client-facing handle for the control task.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlHandle {
    pub async fn request(&self, command: ControlCommand) -> Result<ControlResult, ControlCallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControlMessage { command, reply_tx })
            .await
            .map_err(|_| ControlCallError::Send)?;
        reply_rx.await.map_err(|_| ControlCallError::Recv)
    }
}

/// Call-level transport errors for control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCallError {
    Send,
    Recv,
}

impl fmt::Display for ControlCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCallError::Send => write!(f, "control send failed: control task is not running"),
            ControlCallError::Recv => write!(f, "control recv failed: control task dropped reply sender"),
        }
    }
}

impl std::error::Error for ControlCallError {}

/// Wire-format response envelope for socket transports.
///
/// Serialises as `{"ok": <response>}` or `{"err": <error>}`.
#[derive(Debug, Serialize, Deserialize)]
pub enum WireResponse {
    #[serde(rename = "ok")]
    Ok(ControlResponse),
    #[serde(rename = "err")]
    Err(ControlError),
}

impl From<ControlResult> for WireResponse {
    fn from(r: ControlResult) -> Self {
        match r {
            Ok(resp) => WireResponse::Ok(resp),
            Err(err) => WireResponse::Err(err),
        }
    }
}

/// Spawn the control task. `Shutdown` cancels `shutdown`; the owner of the
/// token is expected to stop the aggregator.
pub fn spawn(aggregator: Aggregator, shutdown: CancellationToken, buffer: usize) -> (ControlHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ControlMessage>(buffer);
    let started = Instant::now();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                msg = rx.recv() => {
                    let Some(ControlMessage { command, reply_tx }) = msg else { break };
                    handle(&aggregator, command, reply_tx, started, &shutdown).await;
                }
            }
        }
        debug!("control task stopped");
    });

    (ControlHandle { tx }, task)
}

async fn handle(
    aggregator: &Aggregator,
    command: ControlCommand,
    reply_tx: oneshot::Sender<ControlResult>,
    started: Instant,
    shutdown: &CancellationToken,
) {
    debug!(cmd = ?command, "control command");
    let response = match command {
        ControlCommand::Health => {
            let backends = aggregator.health().await;
            let healthy = backends.iter().all(|h| h.healthy);
            ControlResponse::Health { healthy, backends }
        }
        ControlCommand::Status => ControlResponse::Status {
            uptime_ms: started.elapsed().as_millis() as u64,
            backends: aggregator.status().await,
        },
        ControlCommand::Capabilities => ControlResponse::Capabilities(aggregator.capabilities().await),
        ControlCommand::Metrics => ControlResponse::Metrics(aggregator.metrics().await),
        // Chat can take up to the response timeout; keep the loop free for
        // status queries meanwhile.
        ControlCommand::Chat { message } => {
            let agg = aggregator.clone();
            tokio::spawn(async move {
                let result = agg
                    .dispatch_unary(&message)
                    .await
                    .map(ControlResponse::Chat)
                    .map_err(|e| ControlError::Request { message: e.to_string() });
                let _ = reply_tx.send(result);
            });
            return;
        }
        ControlCommand::Shutdown => {
            info!("shutdown requested over control plane");
            shutdown.cancel();
            ControlResponse::Ack { message: "shutting down".into() }
        }
    };
    let _ = reply_tx.send(Ok(response));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregatorConfig, BackendConfig};

    fn offline() -> Aggregator {
        let mut config = AggregatorConfig::new(vec![BackendConfig::new("alpha", "127.0.0.1:1")]);
        config.discovery.skip = true;
        config.reconnect.base_delay_ms = 10_000;
        Aggregator::new(config)
    }

    #[test]
    fn commands_parse_from_json() {
        let cmd: ControlCommand = serde_json::from_str(r#""Metrics""#).unwrap();
        assert_eq!(cmd, ControlCommand::Metrics);
        let cmd: ControlCommand = serde_json::from_str(r#"{"Chat":{"message":"hi"}}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Chat { message: "hi".into() });
    }

    #[test]
    fn wire_response_envelope() {
        let ok = WireResponse::from(Ok(ControlResponse::Ack { message: "x".into() }));
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["ok"]["Ack"]["message"], "x");

        let err = WireResponse::from(Err(ControlError::Invalid { message: "bad".into() }));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["err"]["Invalid"]["message"], "bad");
    }

    #[tokio::test]
    async fn metrics_and_status_are_served() {
        let agg = offline();
        agg.initialize().await.unwrap();
        let shutdown = CancellationToken::new();
        let (handle, _task) = spawn(agg.clone(), shutdown.clone(), 8);

        let Ok(ControlResponse::Metrics(m)) = handle.request(ControlCommand::Metrics).await.unwrap() else {
            panic!("expected metrics");
        };
        assert_eq!(m.connected_backends, 0);

        let Ok(ControlResponse::Status { backends, .. }) = handle.request(ControlCommand::Status).await.unwrap()
        else {
            panic!("expected status");
        };
        assert_eq!(backends[0].name, "alpha");

        shutdown.cancel();
        agg.shutdown().await;
    }

    #[tokio::test]
    async fn chat_without_backends_is_request_error() {
        let agg = offline();
        agg.initialize().await.unwrap();
        let (handle, _task) = spawn(agg.clone(), CancellationToken::new(), 8);

        let result = handle.request(ControlCommand::Chat { message: "hi".into() }).await.unwrap();
        let Err(ControlError::Request { message }) = result else { panic!("expected request error") };
        assert!(message.contains("no backend"));
        agg.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_command_cancels_token() {
        let agg = offline();
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn(agg, shutdown.clone(), 8);

        let result = handle.request(ControlCommand::Shutdown).await.unwrap();
        assert!(matches!(result, Ok(ControlResponse::Ack { .. })));
        assert!(shutdown.is_cancelled());
        task.await.unwrap();
        assert_eq!(handle.request(ControlCommand::Health).await.unwrap_err(), ControlCallError::Send);
    }
}
