//! Configuration module for Quota-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use quota_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Credential pool size: {}", config.credentials.len());
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CredentialEntry, EngineConfig, HealthConfig, ModeEntry, ModeKind, NoCredentialPolicy,
    OutputConfig, PayloadConfig, ProxyConfig, RetryConfig, TelemetryConfig, WindowConfig,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, load_config, load_config_with_hash, parse_config, resolve_token,
};
