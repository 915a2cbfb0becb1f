//! Per-backend connection task.
//!
//! Connects, runs a session until the channel closes, then backs off
//! according to its [`RetryTracker`] and tries again. The loop stops on
//! shutdown or when the retry ceiling is reached.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::{RetryState, RetryTracker};
use super::discovery::socket_addr;
use super::wire::{self, Inbound};
use super::{ConnectionEvent, ConnectionManager, FrameSink};
use crate::health::HealthReporter;

pub(super) struct ConnectionTask {
    pub backend: String,
    pub manager: ConnectionManager,
    pub sink: Arc<dyn FrameSink>,
    pub tracker: RetryTracker,
    pub connect_timeout: Duration,
    pub health: HealthReporter,
    pub shutdown: CancellationToken,
}

enum SessionEnd {
    Shutdown,
    Closed(String),
}

impl ConnectionTask {
    pub async fn run(mut self, first_attempt: oneshot::Sender<()>) {
        let mut first_attempt = Some(first_attempt);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.tracker.begin_attempt();
            self.manager.mark_connecting(&self.backend).await;
            let Some(endpoint) = self.manager.endpoint(&self.backend).await else { break };

            let reason = match self.connect(&endpoint).await {
                Ok(stream) => {
                    self.tracker.on_connected();
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.manager.mark_connected(&self.backend, tx).await;
                    self.health.set_connected(&endpoint).await;
                    info!(backend = %self.backend, endpoint = %endpoint, "backend connected");
                    if let Some(tx) = first_attempt.take() {
                        let _ = tx.send(());
                    }

                    match self.session(stream, rx).await {
                        SessionEnd::Shutdown => {
                            if self.manager.mark_disconnected(&self.backend, 0).await {
                                self.sink.backend_lost(&self.backend);
                            }
                            break;
                        }
                        SessionEnd::Closed(reason) => {
                            info!(backend = %self.backend, reason = %reason, "backend connection closed");
                            reason
                        }
                    }
                }
                Err(reason) => {
                    debug!(backend = %self.backend, endpoint = %endpoint, reason = %reason, "connect failed");
                    reason
                }
            };

            let next = self.tracker.on_failure();
            let attempt = self.tracker.attempt();
            if self.manager.mark_disconnected(&self.backend, attempt).await {
                self.sink.backend_lost(&self.backend);
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            self.manager.metrics().record_reconnect_attempt();
            match next {
                RetryState::GaveUp { attempts } => {
                    let message = format!("gave up after {attempts} attempts: {reason}");
                    self.health.set_down(Some(endpoint.as_str()), attempts, message).await
                }
                _ => self.health.set_down(Some(endpoint.as_str()), attempt, reason).await,
            }
            if let Some(tx) = first_attempt.take() {
                let _ = tx.send(());
            }

            match next {
                RetryState::GaveUp { attempts } => {
                    warn!(backend = %self.backend, attempts, "giving up on backend");
                    self.manager.emit(ConnectionEvent::GaveUp { backend: self.backend.clone(), attempts });
                    break;
                }
                _ => {
                    let delay = self.tracker.remaining().unwrap_or_default();
                    self.manager.emit(ConnectionEvent::RetryScheduled {
                        backend: self.backend.clone(),
                        attempt,
                        delay,
                    });
                    debug!(backend = %self.backend, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!(backend = %self.backend, "connection task stopped");
    }

    async fn connect(&self, endpoint: &str) -> Result<TcpStream, String> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr(endpoint))).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connect timed out after {}ms", self.connect_timeout.as_millis())),
        }
    }

    async fn session(&self, stream: TcpStream, mut outbound: mpsc::UnboundedReceiver<Bytes>) -> SessionEnd {
        let mut framed = Framed::new(stream, wire::codec());

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    let _ = SinkExt::<Bytes>::close(&mut framed).await;
                    return SessionEnd::Shutdown;
                }

                Some(payload) = outbound.recv() => {
                    if let Err(e) = framed.send(payload).await {
                        return SessionEnd::Closed(format!("write failed: {e}"));
                    }
                }

                frame = framed.next() => match frame {
                    None => return SessionEnd::Closed("closed by peer".into()),
                    Some(Err(e)) => return SessionEnd::Closed(format!("read failed: {e}")),
                    Some(Ok(buf)) => self.on_payload(&buf).await,
                },
            }
        }
    }

    async fn on_payload(&self, buf: &[u8]) {
        match wire::decode(buf) {
            Ok(Inbound::Frame(frame)) => {
                trace!(backend = %self.backend, kind = frame.body.label(), "inbound frame");
                self.sink.deliver(&self.backend, frame);
            }
            Ok(Inbound::Capabilities(caps)) => {
                self.manager.record_capabilities(&self.backend, caps).await;
            }
            Ok(Inbound::Ignored { kind }) => {
                trace!(backend = %self.backend, kind = %kind, "ignoring frame");
            }
            Err(e) => {
                warn!(backend = %self.backend, error = %e, "dropping malformed frame");
                self.manager.metrics().record_dropped_frame();
            }
        }
    }
}
