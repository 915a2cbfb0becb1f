//! One outstanding logical request.
//!
//! A [`PendingRequest`] lives in the correlator's table from registration
//! until it is completed, fails, times out or is cancelled. All of those
//! consume it, so its completion sender fires at most once.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::oneshot;
use tokio_util::time::delay_queue;

use super::{BackendOutcome, ChunkCallback, StreamChunk, StreamedResponse};
use crate::backends::{BackendReply, FrameBody};
use crate::core::error::AggregatorError;
use crate::synth::{FALLBACK_TEXT, ResponseKind};

pub(super) type Done<T> = oneshot::Sender<Result<T, AggregatorError>>;

/// Response shape together with the caller's completion.
pub(super) enum Shape {
    Unary { done: Done<Vec<BackendOutcome>> },
    Streaming { on_chunk: Option<ChunkCallback>, done: Done<StreamedResponse> },
}

pub(super) struct PendingRequest {
    pub id: String,
    /// Priority order.
    targets: Vec<String>,
    finished: BTreeSet<String>,
    outcomes: HashMap<String, Result<BackendReply, AggregatorError>>,
    buffers: HashMap<String, String>,
    sources: BTreeSet<String>,
    capabilities: BTreeSet<String>,
    failures: BTreeMap<String, String>,
    shape: Shape,
    pub timer: Option<delay_queue::Key>,
}

impl PendingRequest {
    pub fn new(id: String, targets: Vec<String>, shape: Shape) -> Self {
        Self {
            id,
            targets,
            finished: BTreeSet::new(),
            outcomes: HashMap::new(),
            buffers: HashMap::new(),
            sources: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            failures: BTreeMap::new(),
            shape,
            timer: None,
        }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// `true` if `backend` is targeted and has not settled yet.
    pub fn awaits(&self, backend: &str) -> bool {
        self.targets.iter().any(|t| t == backend) && !self.finished.contains(backend)
    }

    pub fn all_finished(&self) -> bool {
        self.finished.len() == self.targets.len()
    }

    /// Apply one inbound frame from `backend`. Returns `true` once every
    /// target has settled.
    pub fn apply(&mut self, backend: &str, body: FrameBody) -> bool {
        let streaming = matches!(self.shape, Shape::Streaming { .. });
        match body {
            FrameBody::Chunk { content } => {
                self.buffers.entry(backend.to_string()).or_default().push_str(&content);
                if streaming {
                    self.emit(backend, content);
                }
            }
            FrameBody::End if streaming => {
                self.finished.insert(backend.to_string());
                self.sources.insert(backend.to_string());
            }
            FrameBody::End => match self.buffers.remove(backend) {
                Some(text) if !text.is_empty() => self.settle_ok(backend, BackendReply::text(text)),
                _ => self.settle_err(
                    backend,
                    AggregatorError::BackendError {
                        backend: backend.to_string(),
                        message: "stream ended without content".into(),
                    },
                ),
            },
            // A whole answer on a streaming request is that backend's full content.
            FrameBody::Unary(reply) if streaming => {
                self.emit(backend, reply.text.clone());
                self.buffers.insert(backend.to_string(), reply.text);
                self.capabilities.extend(reply.capabilities);
                self.finished.insert(backend.to_string());
                self.sources.insert(backend.to_string());
            }
            FrameBody::Unary(reply) => self.settle_ok(backend, reply),
            FrameBody::Error { message } => self.settle_err(
                backend,
                AggregatorError::BackendError { backend: backend.to_string(), message },
            ),
        }
        self.all_finished()
    }

    fn emit(&mut self, backend: &str, content: String) {
        if let Shape::Streaming { on_chunk: Some(cb), .. } = &mut self.shape {
            cb(StreamChunk { correlation_id: self.id.clone(), backend: backend.to_string(), content });
        }
    }

    /// Settle `backend`'s leg as failed. Returns `true` once every target has
    /// settled.
    pub fn fail_leg(&mut self, backend: &str, error: AggregatorError) -> bool {
        if self.awaits(backend) {
            self.settle_err(backend, error);
        }
        self.all_finished()
    }

    fn settle_ok(&mut self, backend: &str, reply: BackendReply) {
        self.capabilities.extend(reply.capabilities.iter().cloned());
        self.sources.insert(backend.to_string());
        self.outcomes.insert(backend.to_string(), Ok(reply));
        self.finished.insert(backend.to_string());
    }

    fn settle_err(&mut self, backend: &str, error: AggregatorError) {
        self.failures.insert(backend.to_string(), error.to_string());
        self.outcomes.insert(backend.to_string(), Err(error));
        self.finished.insert(backend.to_string());
    }

    /// Resolve the caller with what was collected.
    pub fn complete(mut self) {
        match self.shape {
            Shape::Unary { done } => {
                let outcomes = self
                    .targets
                    .into_iter()
                    .map(|backend| {
                        let result = self.outcomes.remove(&backend).unwrap_or_else(|| {
                            Err(AggregatorError::ConnectionUnavailable { backend: backend.clone() })
                        });
                        BackendOutcome { backend, result }
                    })
                    .collect();
                let _ = done.send(Ok(outcomes));
            }
            Shape::Streaming { done, .. } => {
                // Partial output of a failed leg stays out of the answer.
                let finished: Vec<&String> = self.targets.iter().filter(|t| self.sources.contains(*t)).collect();
                let (kind, text) = match finished.len() {
                    0 => (ResponseKind::FallbackResponse, FALLBACK_TEXT.to_string()),
                    n => (
                        if n == 1 { ResponseKind::UnifiedResponse } else { ResponseKind::SynthesizedResponse },
                        finished
                            .iter()
                            .filter_map(|t| self.buffers.get(*t))
                            .filter(|b| !b.is_empty())
                            .map(String::as_str)
                            .collect::<Vec<_>>()
                            .join("\n\n"),
                    ),
                };
                let sources = finished.into_iter().cloned().collect();
                let _ = done.send(Ok(StreamedResponse {
                    correlation_id: self.id,
                    kind,
                    text,
                    sources,
                    capabilities: self.capabilities.into_iter().collect(),
                    failures: self.failures,
                }));
            }
        }
    }

    /// Resolve the caller with a request-level error.
    pub fn fail(self, error: AggregatorError) {
        match self.shape {
            Shape::Unary { done } => {
                let _ = done.send(Err(error));
            }
            Shape::Streaming { done, .. } => {
                let _ = done.send(Err(error));
            }
        }
    }
}
