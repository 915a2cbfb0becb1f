//! Response synthesis.
//!
//! Turns the per-backend outcomes of a unary request into one answer:
//!
//! - no success: a fixed fallback answer, never an error
//! - one success: that answer verbatim
//! - several successes: `[backend] text` segments in priority order
//!
//! With synthesis disabled, the highest-priority success is returned alone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::BackendOutcome;

pub const FALLBACK_TEXT: &str =
    "No backend was able to answer this request right now. Please try again shortly.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    UnifiedResponse,
    SynthesizedResponse,
    FallbackResponse,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::UnifiedResponse => "unified_response",
            ResponseKind::SynthesizedResponse => "synthesized_response",
            ResponseKind::FallbackResponse => "fallback_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResponse {
    pub kind: ResponseKind,
    pub text: String,
    pub sources: Vec<String>,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AggregatedResponse {
    pub fn fallback() -> Self {
        Self {
            kind: ResponseKind::FallbackResponse,
            text: FALLBACK_TEXT.to_string(),
            sources: Vec::new(),
            capabilities: Vec::new(),
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Synthesizer {
    enabled: bool,
}

impl Synthesizer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `outcomes` must already be in priority order.
    pub fn synthesize(&self, outcomes: &[BackendOutcome]) -> AggregatedResponse {
        let fulfilled: Vec<_> = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|r| (o.backend.as_str(), r)))
            .collect();

        match fulfilled.as_slice() {
            [] => AggregatedResponse::fallback(),
            [(backend, reply), ..] if fulfilled.len() == 1 || !self.enabled => AggregatedResponse {
                kind: ResponseKind::UnifiedResponse,
                text: reply.text.clone(),
                sources: vec![backend.to_string()],
                capabilities: dedup(reply.capabilities.iter()),
                metadata: reply.metadata.clone(),
            },
            many => {
                let text = many
                    .iter()
                    .map(|(backend, reply)| format!("[{backend}] {}", reply.text))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let mut metadata = Map::new();
                for (_, reply) in many {
                    for (k, v) in &reply.metadata {
                        metadata.insert(k.clone(), v.clone());
                    }
                }
                AggregatedResponse {
                    kind: ResponseKind::SynthesizedResponse,
                    text,
                    sources: many.iter().map(|(b, _)| b.to_string()).collect(),
                    capabilities: dedup(many.iter().flat_map(|(_, r)| r.capabilities.iter())),
                    metadata,
                }
            }
        }
    }
}

fn dedup<'a>(caps: impl Iterator<Item = &'a String>) -> Vec<String> {
    caps.cloned().collect::<BTreeSet<_>>().into_iter().collect()
}
