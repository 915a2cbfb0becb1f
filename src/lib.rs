//! Chorus: fans one chat request out to several long-lived backend services,
//! correlates their replies and merges them into a single answer.
//!
//! The binary entry point is `src/main.rs`; everything it wires together is
//! exposed here so integration tests can drive the [`aggregator::Aggregator`]
//! against mock backends.

pub mod aggregator;
pub mod backends;
pub mod bootstrap;
pub mod capabilities;
pub mod control;
pub mod core;
pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod router;
pub mod synth;

pub use crate::core::{config, error};
