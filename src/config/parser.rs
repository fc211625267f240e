use crate::config::types::{Config, CredentialEntry};
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use quota_harvest::config::load_config;
///
/// let config = load_config(Path::new("harvest.toml")).unwrap();
/// println!("Credentials: {}", config.credentials.len());
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Logged at startup so telemetry from different runs can be tied to the
/// exact configuration that produced it.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    Ok(hex::encode(result))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}

/// Resolves the secret token of a credential entry
///
/// Inline tokens win; otherwise the token file is read and trimmed.
pub fn resolve_token(entry: &CredentialEntry) -> Result<String, ConfigError> {
    if let Some(token) = &entry.token {
        return Ok(token.trim().to_string());
    }

    match &entry.token_file {
        Some(path) => Ok(std::fs::read_to_string(path)?.trim().to_string()),
        None => Err(ConfigError::Validation(format!(
            "credential '{}' has neither token nor token-file",
            entry.label
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModeKind, NoCredentialPolicy};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const VALID_CONFIG: &str = r#"
[engine]
max-in-flight = 8
lane-max-concurrent = 2
lane-min-spacing-ms = 500
on-no-credential = "stall"

[proxy]
host = "proxy.example.com"
port = 8000
username = "user-{label}-{session}"
password = "secret"

[[credential]]
label = "acct-1"
token = "SUB=abc; XSRF-TOKEN=tok1"

[[mode]]
name = "keyword"
kind = "windowed-search"
listing-url = "https://api.example.com/search?q={key}&start={start}&end={end}&page={page}"
detail-url = "https://api.example.com/show?id={id}"

[mode.window]
start = "2025-01-01T00:00:00Z"
end = "2025-01-01T03:00:00Z"
"#;

    #[test]
    fn test_load_valid_config() {
        let file = create_temp_config(VALID_CONFIG);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.engine.max_in_flight, 8);
        assert_eq!(config.engine.lane_max_concurrent, 2);
        assert_eq!(config.engine.on_no_credential, NoCredentialPolicy::Stall);
        assert_eq!(config.credentials.len(), 1);

        let proxy = config.proxy.as_ref().unwrap();
        assert_eq!(proxy.scheme, "http");
        assert_eq!(proxy.rotation_interval_secs, 1800);

        let mode = config.mode("keyword").unwrap();
        assert_eq!(mode.kind, ModeKind::WindowedSearch);
        assert_eq!(mode.window.as_ref().unwrap().step_minutes, 60);
    }

    #[test]
    fn test_defaults_applied() {
        let file = create_temp_config(VALID_CONFIG);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.health.failure_threshold, 10);
        assert_eq!(config.health.cooldown_secs, 300);
        assert_eq!(config.health.max_cooldown_cycles, 3);
        assert_eq!(config.retry.search, 3);
        assert_eq!(config.retry.empty_page, 3);
        assert!(config.telemetry.directory.is_none());
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/harvest.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_with_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_config_with_validation_error() {
        let config_content = r#"
[engine]
max-in-flight = 0
"#;
        let file = create_temp_config(config_content);
        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::Validation(_)));
    }

    #[test]
    fn test_resolve_token_from_file() {
        let token_file = create_temp_config("SUB=xyz; XSRF-TOKEN=fromfile\n");
        let entry = CredentialEntry {
            label: "file-acct".to_string(),
            token: None,
            token_file: Some(token_file.path().to_path_buf()),
        };

        assert_eq!(
            resolve_token(&entry).unwrap(),
            "SUB=xyz; XSRF-TOKEN=fromfile"
        );
    }

    #[test]
    fn test_resolve_token_missing() {
        let entry = CredentialEntry {
            label: "empty".to_string(),
            token: None,
            token_file: None,
        };
        assert!(resolve_token(&entry).is_err());
    }

    #[test]
    fn test_compute_config_hash() {
        let file = create_temp_config("test content");

        let hash1 = compute_config_hash(file.path()).unwrap();
        let hash2 = compute_config_hash(file.path()).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }
}
