//! Configuration loading with env-var overrides.
//!
//! Reads TOML files, supports `[meta] base = "..."` inheritance chains,
//! and applies `CHORUS_WORK_DIR`, `CHORUS_LOG_LEVEL` and
//! `CHORUS_RESPONSE_TIMEOUT_MS` env overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::AppError;

use super::raw::{self, RawBackend, RawConfig};
use super::types::*;

/// Env-sourced overrides applied after the file chain is merged.
/// Tests pass these directly instead of mutating process env.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub work_dir: Option<String>,
    pub log_level: Option<String>,
    pub response_timeout_ms: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            work_dir: env::var("CHORUS_WORK_DIR").ok(),
            log_level: env::var("CHORUS_LOG_LEVEL").ok(),
            response_timeout_ms: env::var("CHORUS_RESPONSE_TIMEOUT_MS").ok(),
        }
    }
}

/// Deep-merge two TOML values.
/// Tables are merged recursively; the overlay only needs to specify keys that
/// differ from the base. For every other type (string, integer, array, …)
/// the overlay value replaces the base value wholesale.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                let merged = match base_tbl.remove(&key) {
                    Some(base_val) => merge_toml(base_val, ov_val),
                    None => ov_val,
                };
                base_tbl.insert(key, merged);
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file, follow any `[meta] base = "..."` chain, and return the
/// fully merged `toml::Value`. `visited` carries canonicalized paths already
/// seen in this chain so circular references are caught early.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let overlay_val: toml::Value = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    if let Some(base_str) = overlay_val
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
    {
        let base_path = if Path::new(base_str).is_absolute() {
            PathBuf::from(base_str)
        } else {
            path.parent().unwrap_or(Path::new(".")).join(base_str)
        };
        let base_val = load_raw_merged(&base_path, visited)?;
        Ok(merge_toml(base_val, overlay_val))
    } else {
        Ok(overlay_val)
    }
}

/// Load config from the given path, or `config/default.toml`, then apply env-var overrides.
/// If no path is given and `config/default.toml` does not exist, returns a hardcoded minimal default.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let overrides = EnvOverrides::from_env();

    if let Some(path) = config_path {
        return load_from(Path::new(path), &overrides);
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        load_from(default_path, &overrides)
    } else {
        hardcoded_default(&overrides)
    }
}

/// Load from an explicit path and apply `overrides`.
pub fn load_from(path: &Path, overrides: &EnvOverrides) -> Result<Config, AppError> {
    let mut visited = HashSet::new();
    let merged = load_raw_merged(path, &mut visited)?;

    let parsed: RawConfig = merged
        .try_into()
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    resolve(parsed, overrides)
}

/// Two local backends, one per router domain.
fn hardcoded_default(overrides: &EnvOverrides) -> Result<Config, AppError> {
    let parsed = RawConfig {
        service: raw::RawService::default(),
        dispatch: raw::RawDispatch::default(),
        discovery: raw::RawDiscovery::default(),
        reconnect: raw::RawReconnect::default(),
        capabilities: raw::RawCapabilities::default(),
        control: raw::RawControl::default(),
        backends: vec![
            RawBackend {
                name: "alpha".to_string(),
                endpoint: "127.0.0.1:9101".to_string(),
                candidate_endpoints: Vec::new(),
                domain: Some("systems".to_string()),
                capabilities: Vec::new(),
            },
            RawBackend {
                name: "beta".to_string(),
                endpoint: "127.0.0.1:9102".to_string(),
                candidate_endpoints: Vec::new(),
                domain: Some("creative".to_string()),
                capabilities: Vec::new(),
            },
        ],
    };
    resolve(parsed, overrides)
}

fn resolve(parsed: RawConfig, overrides: &EnvOverrides) -> Result<Config, AppError> {
    let s = parsed.service;

    let work_dir_str = overrides.work_dir.clone().unwrap_or(s.work_dir);
    let work_dir = expand_home(&work_dir_str);
    let log_level = overrides.log_level.clone().unwrap_or(s.log_level);
    let log_file = s.log_file.map(|p| relative_to(&work_dir, &p));

    let response_timeout_ms = match overrides.response_timeout_ms.as_deref() {
        Some(v) => v.trim().parse::<u64>().map_err(|e| {
            AppError::Config(format!("invalid CHORUS_RESPONSE_TIMEOUT_MS '{v}': {e}"))
        })?,
        None => parsed.dispatch.response_timeout_ms,
    };

    let backends = resolve_backends(parsed.backends)?;

    let socket_path = parsed
        .control
        .socket_path
        .map(|p| relative_to(&work_dir, &p))
        .unwrap_or_else(|| work_dir.join("chorus.sock"));

    if parsed.reconnect.base_delay_ms == 0 {
        return Err(AppError::Config("reconnect.base_delay_ms must be > 0".into()));
    }
    if response_timeout_ms == 0 {
        return Err(AppError::Config("dispatch.response_timeout_ms must be > 0".into()));
    }

    Ok(Config {
        service_name: s.name,
        work_dir,
        log_level,
        log_file,
        control: ControlConfig {
            enabled: parsed.control.enabled,
            socket_path,
        },
        aggregator: AggregatorConfig {
            backends,
            dispatch: DispatchConfig {
                response_timeout_ms,
                enable_parallel_processing: parsed.dispatch.enable_parallel_processing,
                enable_response_synthesis: parsed.dispatch.enable_response_synthesis,
                legacy_uncorrelated_fallback: parsed.dispatch.legacy_uncorrelated_fallback,
            },
            discovery: DiscoveryConfig {
                skip: parsed.discovery.skip,
                probe_timeout_ms: parsed.discovery.probe_timeout_ms,
            },
            reconnect: ReconnectConfig {
                base_delay_ms: parsed.reconnect.base_delay_ms,
                // A cap below base would make the schedule decrease.
                cap_delay_ms: parsed.reconnect.cap_delay_ms.max(parsed.reconnect.base_delay_ms),
                max_attempts: parsed.reconnect.max_attempts,
                connect_timeout_ms: parsed.reconnect.connect_timeout_ms,
            },
            capability_sync_interval_secs: parsed.capabilities.sync_interval_secs.max(1),
        },
    })
}

fn resolve_backends(raw: Vec<RawBackend>) -> Result<Vec<BackendConfig>, AppError> {
    if raw.is_empty() {
        return Err(AppError::Config("at least one [[backends]] entry is required".into()));
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for b in raw {
        if b.name.trim().is_empty() {
            return Err(AppError::Config("backend name must not be empty".into()));
        }
        if !seen.insert(b.name.clone()) {
            return Err(AppError::Config(format!("duplicate backend name: '{}'", b.name)));
        }
        let domain = b
            .domain
            .as_deref()
            .map(str::parse::<Domain>)
            .transpose()
            .map_err(|e| AppError::Config(format!("backend '{}': {e}", b.name)))?;
        out.push(BackendConfig {
            name: b.name,
            endpoint: b.endpoint,
            candidate_endpoints: b.candidate_endpoints,
            domain,
            capabilities: b.capabilities,
        });
    }
    Ok(out)
}

fn relative_to(base: &Path, p: &str) -> PathBuf {
    let path = expand_home(p);
    if path.is_absolute() { path } else { base.join(path) }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
