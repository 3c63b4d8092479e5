//! sqlweave core
//!
//! Shared domain types for every sqlweave crate: stable diagnostic codes and
//! the project configuration read from `sqlweave.toml`.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod config;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use config::{
    Config, ConfigError, Materialization, ModelDefaults, TargetConfig, DEFAULT_THREADS,
};
