//! Quota-Harvest: a credential-rotating harvester for paginated JSON APIs
//!
//! This crate keeps a fleet of outbound requests flowing against a remote API that
//! enforces per-credential quotas, rotating credentials and proxies, pacing each
//! credential+proxy lane, and paginating time windows and threads to exhaustion.

pub mod config;
pub mod crawler;
pub mod output;
pub mod session;

use thiserror::Error;

/// Main error type for Quota-Harvest operations
///
/// Per-request failures never surface here; they are retried or abandoned inside
/// the crawl loop. These variants cover startup and output failures.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown crawl mode: {0}")]
    UnknownMode(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Seed error: {0}")]
    Seed(String),

    #[error("Output error: {0}")]
    Output(#[from] crate::output::OutputError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid URL template: {0}")]
    InvalidTemplate(String),
}

/// Result type alias for Quota-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Coordinator, CrawlMode, FetchIntent, RequestContext};
pub use session::{Credential, CredentialState, SessionDispatcher};
