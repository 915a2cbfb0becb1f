//! Keyword router.
//!
//! A message is matched, case-insensitively and by substring, against one
//! vocabulary per [`Domain`]. Exactly one matching vocabulary narrows the
//! route to connected backends of that domain; no match or an ambiguous
//! match broadcasts to every connected backend. An empty selection falls
//! back to the first connected backend in priority order.

use std::collections::BTreeMap;

use crate::config::{BackendConfig, Domain};

pub const SYSTEMS_KEYWORDS: &[&str] = &[
    "optimize",
    "registry",
    "module",
    "code",
    "system",
    "performance",
    "refactor",
    "debug",
    "analyze",
    "architecture",
];

pub const CREATIVE_KEYWORDS: &[&str] = &[
    "reality",
    "spiral",
    "consciousness",
    "dream",
    "hologram",
    "quantum",
    "evolution",
    "crystal",
    "imagine",
    "creative",
];

fn vocabulary(domain: Domain) -> &'static [&'static str] {
    match domain {
        Domain::Systems => SYSTEMS_KEYWORDS,
        Domain::Creative => CREATIVE_KEYWORDS,
    }
}

/// The single domain whose vocabulary matches `message`, if exactly one does.
pub fn classify(message: &str) -> Option<Domain> {
    let lower = message.to_lowercase();
    let hits = |d: Domain| vocabulary(d).iter().any(|k| lower.contains(k));
    match (hits(Domain::Systems), hits(Domain::Creative)) {
        (true, false) => Some(Domain::Systems),
        (false, true) => Some(Domain::Creative),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    /// Priority order.
    backends: Vec<(String, Option<Domain>)>,
    parallel: bool,
}

impl Router {
    pub fn new(backends: &[BackendConfig], parallel: bool) -> Self {
        Self {
            backends: backends.iter().map(|b| (b.name.clone(), b.domain)).collect(),
            parallel,
        }
    }

    /// Ordered targets for `message`. Empty only when nothing is connected.
    pub fn route(&self, message: &str, status: &BTreeMap<String, bool>) -> Vec<String> {
        let connected: Vec<&(String, Option<Domain>)> = self
            .backends
            .iter()
            .filter(|(name, _)| status.get(name).copied().unwrap_or(false))
            .collect();
        let Some(first) = connected.first() else {
            return Vec::new();
        };

        let mut targets: Vec<String> = match classify(message) {
            None => connected.iter().map(|(n, _)| n.clone()).collect(),
            Some(domain) => connected
                .iter()
                .filter(|(_, d)| *d == Some(domain))
                .map(|(n, _)| n.clone())
                .collect(),
        };
        if targets.is_empty() {
            targets.push(first.0.clone());
        }
        if !self.parallel {
            targets.truncate(1);
        }
        targets
    }
}
