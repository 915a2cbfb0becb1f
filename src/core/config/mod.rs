//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `CHORUS_*` env overrides.
//!
//! # Module layout
//!
//! - **types**: Public configuration structs consumed by the aggregator
//!   (`Config`, `AggregatorConfig`, `BackendConfig`, etc.).
//! - **raw**: Raw TOML deserialization types (`RawConfig`, `RawBackend`, …).
//!   These mirror the file shape and use serde defaults; kept private.
//! - **load**: Loading logic: `merge_toml`, `load_raw_merged`, `load`,
//!   `load_from`, `expand_home`.

mod load;
mod raw;
mod types;

pub use load::{EnvOverrides, expand_home, load, load_from};
pub use types::*;
