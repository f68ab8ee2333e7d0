//! Aggregator Configuration Module
//!
//! Configuration loaded from a TOML file; every table is optional.
//!
//! ## Loading Order
//!
//! 1. `NDEFENDER_CONFIG` environment variable (path to TOML file)
//! 2. `aggregator.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! The binary's `--config` flag bypasses the search and calls
//! [`AggregatorConfig::load_from_file`] directly.

mod aggregator_config;
pub mod defaults;

pub use aggregator_config::*;
