//! Bootstrap layer: modules that run before the aggregator starts.
//!
//! - **logger**: tracing-subscriber initialisation.

pub mod logger;
