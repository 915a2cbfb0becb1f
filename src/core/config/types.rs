//! Public configuration types.
//!
//! These are the resolved, ready-to-use structs that the aggregator consumes.
//! Raw TOML deserialization types live in `raw.rs`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::raw;

// ── Backends ─────────────────────────────────────────────────────────────────

/// Router vocabulary a backend answers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Code, systems and optimisation requests.
    Systems,
    /// Open-ended, exploratory and creative requests.
    Creative,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Systems => "systems",
            Domain::Creative => "creative",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "systems" => Ok(Domain::Systems),
            "creative" => Ok(Domain::Creative),
            other => Err(format!("unknown backend domain: '{other}'")),
        }
    }
}

/// One configured backend service.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Stable name used in routing, labels and status maps.
    pub name: String,
    /// `host:port` (optionally `tcp://host:port`) used when discovery is
    /// skipped or finds nothing.
    pub endpoint: String,
    /// Ordered endpoints probed by startup discovery.
    pub candidate_endpoints: Vec<String>,
    /// Router vocabulary; `None` = only reached by broadcast or fallback.
    pub domain: Option<Domain>,
    /// Static capability list used until the backend reports its own.
    pub capabilities: Vec<String>,
}

impl BackendConfig {
    /// Minimal backend entry, mostly for tests and the hardcoded default.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            candidate_endpoints: Vec::new(),
            domain: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_candidates<I, S>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidate_endpoints = candidates.into_iter().map(Into::into).collect();
        self
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

/// Fan-out and correlation settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Single timer covering the whole logical request.
    pub response_timeout_ms: u64,
    /// `false` narrows every route to its first target.
    pub enable_parallel_processing: bool,
    /// `false` returns the highest-priority answer instead of a merged one.
    pub enable_response_synthesis: bool,
    /// Route frames without a correlation id to the sole pending request.
    pub legacy_uncorrelated_fallback: bool,
}

impl DispatchConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: raw::default_response_timeout_ms(),
            enable_parallel_processing: true,
            enable_response_synthesis: true,
            legacy_uncorrelated_fallback: true,
        }
    }
}

// ── Connections ──────────────────────────────────────────────────────────────

/// Startup endpoint discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub skip: bool,
    /// Per-candidate connect-test timeout.
    pub probe_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { skip: false, probe_timeout_ms: raw::default_probe_timeout_ms() }
    }
}

/// Reconnection backoff: `min(base × 2^(attempt−1), cap)`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub cap_delay_ms: u64,
    /// `None` = retry indefinitely.
    pub max_attempts: Option<u32>,
    /// Upper bound on a single connect attempt.
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: raw::default_base_delay_ms(),
            cap_delay_ms: raw::default_cap_delay_ms(),
            max_attempts: None,
            connect_timeout_ms: raw::default_connect_timeout_ms(),
        }
    }
}

/// Everything the [`crate::aggregator::Aggregator`] needs to run.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Backends in priority order.
    pub backends: Vec<BackendConfig>,
    pub dispatch: DispatchConfig,
    pub discovery: DiscoveryConfig,
    pub reconnect: ReconnectConfig,
    /// Periodic capability refresh interval.
    pub capability_sync_interval_secs: u64,
}

impl AggregatorConfig {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            backends,
            dispatch: DispatchConfig::default(),
            discovery: DiscoveryConfig::default(),
            reconnect: ReconnectConfig::default(),
            capability_sync_interval_secs: raw::default_sync_interval_secs(),
        }
    }

    /// Backend names in priority order.
    pub fn priority(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name.clone()).collect()
    }
}

// ── Control ──────────────────────────────────────────────────────────────────

/// Unix-domain control socket.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub enabled: bool,
    /// Resolved socket path (defaults to `{work_dir}/chorus.sock`).
    pub socket_path: PathBuf,
}

/// Fully-resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    /// Working directory for runtime files (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    /// Append logs here instead of stderr.
    pub log_file: Option<PathBuf>,
    pub control: ControlConfig,
    pub aggregator: AggregatorConfig,
}
