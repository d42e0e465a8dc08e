//! Configuration store for hwtranscode
//!
//! Handles loading configuration from TOML files, environment variable overrides,
//! and the named encoding presets jobs are submitted against.

pub mod config;
pub mod preset;

pub use config::*;
pub use preset::*;
