//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults.
//! The `load` module converts them into the public `types` structs.

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape: serde target before resolution.
#[derive(Deserialize)]
pub(super) struct RawConfig {
    #[serde(default)]
    pub service: RawService,
    #[serde(default)]
    pub dispatch: RawDispatch,
    #[serde(default)]
    pub discovery: RawDiscovery,
    #[serde(default)]
    pub reconnect: RawReconnect,
    #[serde(default)]
    pub capabilities: RawCapabilities,
    #[serde(default)]
    pub control: RawControl,
    #[serde(default)]
    pub backends: Vec<RawBackend>,
}

#[derive(Deserialize)]
pub(super) struct RawService {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for RawService {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            work_dir: default_work_dir(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawDispatch {
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_parallel_processing: bool,
    #[serde(default = "default_true")]
    pub enable_response_synthesis: bool,
    /// Match frames without a correlation id to the sole pending request.
    #[serde(default = "default_true")]
    pub legacy_uncorrelated_fallback: bool,
}

impl Default for RawDispatch {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            enable_parallel_processing: true,
            enable_response_synthesis: true,
            legacy_uncorrelated_fallback: true,
        }
    }
}

// ── Connections ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawDiscovery {
    #[serde(default = "default_false")]
    pub skip: bool,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for RawDiscovery {
    fn default() -> Self {
        Self { skip: false, probe_timeout_ms: default_probe_timeout_ms() }
    }
}

#[derive(Deserialize)]
pub(super) struct RawReconnect {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_cap_delay_ms")]
    pub cap_delay_ms: u64,
    /// Absent = retry forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RawReconnect {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            cap_delay_ms: default_cap_delay_ms(),
            max_attempts: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawCapabilities {
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

impl Default for RawCapabilities {
    fn default() -> Self {
        Self { sync_interval_secs: default_sync_interval_secs() }
    }
}

#[derive(Deserialize)]
pub(super) struct RawControl {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub socket_path: Option<String>,
}

impl Default for RawControl {
    fn default() -> Self {
        Self { enabled: true, socket_path: None }
    }
}

/// One `[[backends]]` entry. Array order is the backend priority order.
#[derive(Deserialize)]
pub(super) struct RawBackend {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub candidate_endpoints: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

pub(super) fn default_service_name() -> String { "chorus".to_string() }
pub(super) fn default_work_dir() -> String { "~/.chorus".to_string() }
pub(super) fn default_log_level() -> String { "info".to_string() }
pub(super) fn default_response_timeout_ms() -> u64 { 45_000 }
pub(super) fn default_probe_timeout_ms() -> u64 { 2_000 }
pub(super) fn default_base_delay_ms() -> u64 { 1_000 }
pub(super) fn default_cap_delay_ms() -> u64 { 30_000 }
pub(super) fn default_connect_timeout_ms() -> u64 { 5_000 }
pub(super) fn default_sync_interval_secs() -> u64 { 30 }

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}
