//! Correlator actor.
//!
//! The only owner of the pending-request table. Registrations, inbound
//! frames, leg failures, cancellations and timer expiries are all handled
//! one at a time on this task, so an entry is removed (and its caller
//! resolved) exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use super::DispatchSettings;
use super::pending::PendingRequest;
use crate::backends::InboundFrame;
use crate::core::error::AggregatorError;
use crate::metrics::Metrics;

pub(super) enum CorrelatorMsg {
    Register(PendingRequest),
    Inbound { backend: String, frame: InboundFrame },
    LegFailed { correlation_id: String, backend: String, error: AggregatorError },
    BackendLost { backend: String },
    Cancel { correlation_id: String, reply: oneshot::Sender<bool> },
    PendingCount { reply: oneshot::Sender<usize> },
    IsPending { correlation_id: String, reply: oneshot::Sender<bool> },
    Shutdown,
}

pub(super) struct Correlator {
    rx: mpsc::UnboundedReceiver<CorrelatorMsg>,
    pending: HashMap<String, PendingRequest>,
    timers: DelayQueue<String>,
    settings: DispatchSettings,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Correlator {
    pub fn new(
        rx: mpsc::UnboundedReceiver<CorrelatorMsg>,
        settings: DispatchSettings,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { rx, pending: HashMap::new(), timers: DelayQueue::new(), settings, metrics, shutdown }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                msg = self.rx.recv() => match msg {
                    None | Some(CorrelatorMsg::Shutdown) => break,
                    Some(msg) => self.handle(msg),
                },

                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.expire(expired.into_inner());
                }
            }
        }
        self.drain();
    }

    fn handle(&mut self, msg: CorrelatorMsg) {
        match msg {
            CorrelatorMsg::Register(mut entry) => {
                let key = self.timers.insert(entry.id.clone(), self.settings.response_timeout);
                entry.timer = Some(key);
                debug!(correlation_id = %entry.id, targets = ?entry.targets(), "request registered");
                self.pending.insert(entry.id.clone(), entry);
            }
            CorrelatorMsg::Inbound { backend, frame } => self.on_frame(backend, frame),
            CorrelatorMsg::LegFailed { correlation_id, backend, error } => {
                let done = match self.pending.get_mut(&correlation_id) {
                    Some(entry) => entry.fail_leg(&backend, error),
                    None => false,
                };
                if done {
                    self.finish(&correlation_id);
                }
            }
            CorrelatorMsg::BackendLost { backend } => {
                let error = AggregatorError::ConnectionUnavailable { backend: backend.clone() };
                let done: Vec<String> = self
                    .pending
                    .values_mut()
                    .filter(|e| e.awaits(&backend))
                    .filter_map(|e| e.fail_leg(&backend, error.clone()).then(|| e.id.clone()))
                    .collect();
                for id in done {
                    self.finish(&id);
                }
            }
            CorrelatorMsg::Cancel { correlation_id, reply } => {
                let found = match self.take(&correlation_id) {
                    Some(entry) => {
                        info!(correlation_id = %correlation_id, "request cancelled");
                        self.metrics.record_cancelled();
                        entry.fail(AggregatorError::Cancelled { correlation_id: correlation_id.clone() });
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            CorrelatorMsg::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
            CorrelatorMsg::IsPending { correlation_id, reply } => {
                let _ = reply.send(self.pending.contains_key(&correlation_id));
            }
            CorrelatorMsg::Shutdown => {}
        }
    }

    fn on_frame(&mut self, backend: String, frame: InboundFrame) {
        let id = match frame.correlation_id {
            Some(id) => id,
            None => match self.sole_pending() {
                Some(id) => {
                    debug!(backend = %backend, correlation_id = %id, "uncorrelated frame matched to sole pending request");
                    id
                }
                None => {
                    let err = AggregatorError::UncorrelatedFrame { backend: backend.clone() };
                    warn!(backend = %backend, pending = self.pending.len(), error = %err, "dropping frame");
                    self.metrics.record_dropped_frame();
                    return;
                }
            },
        };

        let Some(entry) = self.pending.get_mut(&id) else {
            debug!(backend = %backend, correlation_id = %id, "frame for unknown or finished request ignored");
            self.metrics.record_dropped_frame();
            return;
        };
        if !entry.awaits(&backend) {
            debug!(backend = %backend, correlation_id = %id, "frame from settled or untargeted backend ignored");
            self.metrics.record_dropped_frame();
            return;
        }
        if entry.apply(&backend, frame.body) {
            self.finish(&id);
        }
    }

    fn sole_pending(&self) -> Option<String> {
        if !self.settings.legacy_uncorrelated_fallback || self.pending.len() != 1 {
            return None;
        }
        self.pending.keys().next().cloned()
    }

    /// Remove an entry and cancel its timer.
    fn take(&mut self, id: &str) -> Option<PendingRequest> {
        let mut entry = self.pending.remove(id)?;
        if let Some(key) = entry.timer.take() {
            self.timers.try_remove(&key);
        }
        Some(entry)
    }

    fn finish(&mut self, id: &str) {
        if let Some(entry) = self.take(id) {
            debug!(correlation_id = %id, "request completed");
            self.metrics.record_completed();
            entry.complete();
        }
    }

    fn expire(&mut self, id: String) {
        // The timer already fired; nothing to cancel.
        let Some(entry) = self.pending.remove(&id) else { return };
        let timeout_ms = self.settings.response_timeout.as_millis() as u64;
        warn!(correlation_id = %id, timeout_ms, "request timed out");
        self.metrics.record_timed_out();
        entry.fail(AggregatorError::ResponseTimeout { correlation_id: id, timeout_ms });
    }

    fn drain(&mut self) {
        if !self.pending.is_empty() {
            info!(pending = self.pending.len(), "draining pending requests");
        }
        self.timers.clear();
        for (_, entry) in self.pending.drain() {
            entry.fail(AggregatorError::Shutdown);
        }
        self.rx.close();
        // Registrations that raced the shutdown.
        while let Ok(msg) = self.rx.try_recv() {
            if let CorrelatorMsg::Register(entry) = msg {
                entry.fail(AggregatorError::Shutdown);
            }
        }
    }
}
