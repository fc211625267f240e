use crate::config::types::{
    Config, CredentialEntry, EngineConfig, HealthConfig, ModeEntry, ModeKind, PayloadConfig,
    ProxyConfig, RetryConfig,
};
use crate::crawler::template;
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_engine_config(&config.engine)?;
    validate_health_config(&config.health)?;
    validate_retry_config(&config.retry)?;
    if let Some(proxy) = &config.proxy {
        validate_proxy_config(proxy)?;
    }
    validate_credentials(&config.credentials)?;
    validate_modes(&config.modes)?;
    Ok(())
}

fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.max_in_flight < 1 || config.max_in_flight > 1000 {
        return Err(ConfigError::Validation(format!(
            "max-in-flight must be between 1 and 1000, got {}",
            config.max_in_flight
        )));
    }

    if config.lane_max_concurrent < 1 {
        return Err(ConfigError::Validation(format!(
            "lane-max-concurrent must be >= 1, got {}",
            config.lane_max_concurrent
        )));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    if let Some(referer) = &config.referer {
        Url::parse(referer)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid referer '{}': {}", referer, e)))?;
    }

    Ok(())
}

fn validate_health_config(config: &HealthConfig) -> Result<(), ConfigError> {
    if config.failure_threshold < 1 {
        return Err(ConfigError::Validation(
            "failure-threshold must be >= 1".to_string(),
        ));
    }

    if config.cooldown_secs < 1 {
        return Err(ConfigError::Validation(
            "cooldown-secs must be >= 1".to_string(),
        ));
    }

    if config.max_cooldown_cycles < 1 {
        return Err(ConfigError::Validation(
            "max-cooldown-cycles must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.base_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "retry base-delay-ms ({}) cannot exceed max-delay-ms ({})",
            config.base_delay_ms, config.max_delay_ms
        )));
    }
    Ok(())
}

fn validate_proxy_config(config: &ProxyConfig) -> Result<(), ConfigError> {
    if !matches!(config.scheme.as_str(), "http" | "https" | "socks5" | "socks5h") {
        return Err(ConfigError::Validation(format!(
            "proxy scheme must be http, https, socks5 or socks5h, got '{}'",
            config.scheme
        )));
    }

    if config.host.is_empty() {
        return Err(ConfigError::Validation(
            "proxy host cannot be empty".to_string(),
        ));
    }

    if config.port == 0 {
        return Err(ConfigError::Validation(
            "proxy port cannot be 0".to_string(),
        ));
    }

    if config.rotation_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "proxy rotation-interval-secs must be >= 1".to_string(),
        ));
    }

    Url::parse(&format!("{}://{}:{}", config.scheme, config.host, config.port))
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid proxy endpoint: {}", e)))?;

    Ok(())
}

fn validate_credentials(credentials: &[CredentialEntry]) -> Result<(), ConfigError> {
    let mut labels = HashSet::new();

    for entry in credentials {
        if entry.label.trim().is_empty() {
            return Err(ConfigError::Validation(
                "credential label cannot be empty".to_string(),
            ));
        }

        if !labels.insert(entry.label.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate credential label '{}'",
                entry.label
            )));
        }

        match (&entry.token, &entry.token_file) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Validation(format!(
                    "credential '{}' must set only one of token and token-file",
                    entry.label
                )))
            }
            (None, None) => {
                return Err(ConfigError::Validation(format!(
                    "credential '{}' must set token or token-file",
                    entry.label
                )))
            }
            (Some(token), None) if token.trim().is_empty() => {
                return Err(ConfigError::Validation(format!(
                    "credential '{}' has an empty token",
                    entry.label
                )))
            }
            _ => {}
        }
    }

    Ok(())
}

fn validate_modes(modes: &[ModeEntry]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();

    for mode in modes {
        if mode.name.is_empty() {
            return Err(ConfigError::Validation(
                "mode name cannot be empty".to_string(),
            ));
        }

        // Two identifiers mapping to one handler is fine; one identifier mapping to two is not.
        if !names.insert(mode.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "mode '{}' is defined more than once",
                mode.name
            )));
        }

        validate_mode(mode)?;
        validate_payload(&mode.name, &mode.payload)?;
    }

    Ok(())
}

fn validate_mode(mode: &ModeEntry) -> Result<(), ConfigError> {
    let (field, required) = match mode.kind {
        ModeKind::WindowedSearch | ModeKind::Threaded | ModeKind::FlatList => {
            ("listing-url", &mode.listing_url)
        }
        ModeKind::Detail => ("detail-url", &mode.detail_url),
    };

    if required.is_none() {
        return Err(ConfigError::Validation(format!(
            "mode '{}' requires {}",
            mode.name, field
        )));
    }

    for url_template in [
        &mode.listing_url,
        &mode.detail_url,
        &mode.long_text_url,
        &mode.replies_url,
    ]
    .into_iter()
    .flatten()
    {
        validate_url_template(&mode.name, url_template)?;
    }

    if mode.kind == ModeKind::WindowedSearch {
        let window = mode.window.as_ref().ok_or_else(|| {
            ConfigError::Validation(format!("mode '{}' requires a [mode.window] table", mode.name))
        })?;

        if window.start >= window.end {
            return Err(ConfigError::Validation(format!(
                "mode '{}' window start must be before end",
                mode.name
            )));
        }

        if window.step_minutes < 1 {
            return Err(ConfigError::Validation(format!(
                "mode '{}' window step-minutes must be >= 1",
                mode.name
            )));
        }
    }

    if mode.cursor_param.is_empty() {
        return Err(ConfigError::Validation(format!(
            "mode '{}' cursor-param cannot be empty",
            mode.name
        )));
    }

    Ok(())
}

/// Checks placeholder names and that the rendered template is a valid URL
fn validate_url_template(mode: &str, url_template: &str) -> Result<(), ConfigError> {
    let names = template::placeholders(url_template)
        .map_err(|e| ConfigError::InvalidTemplate(format!("mode '{}': {}", mode, e)))?;

    for name in &names {
        if !template::KNOWN_PLACEHOLDERS.contains(name) {
            return Err(ConfigError::InvalidTemplate(format!(
                "mode '{}': unknown placeholder {{{}}} in '{}'",
                mode, name, url_template
            )));
        }
    }

    let sample: Vec<(&str, &str)> = template::KNOWN_PLACEHOLDERS
        .iter()
        .map(|name| (*name, "1"))
        .collect();
    let rendered = template::render(url_template, &sample)
        .map_err(|e| ConfigError::InvalidTemplate(format!("mode '{}': {}", mode, e)))?;

    Url::parse(&rendered).map_err(|e| {
        ConfigError::InvalidUrl(format!("mode '{}': '{}' is not a URL: {}", mode, url_template, e))
    })?;

    Ok(())
}

fn validate_payload(mode: &str, payload: &PayloadConfig) -> Result<(), ConfigError> {
    let pointers = [
        Some(&payload.items),
        Some(&payload.item_id),
        Some(&payload.long_text_content),
        payload.no_results.as_ref(),
        payload.next_page.as_ref(),
        payload.nested.as_ref(),
        payload.record.as_ref(),
        payload.long_text_flag.as_ref(),
    ];

    for pointer in pointers.into_iter().flatten() {
        validate_pointer(mode, pointer)?;
    }

    Ok(())
}

/// JSON pointers are empty (whole document) or start with '/'
fn validate_pointer(mode: &str, pointer: &str) -> Result<(), ConfigError> {
    if !pointer.is_empty() && !pointer.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "mode '{}': JSON pointer '{}' must be empty or start with '/'",
            mode, pointer
        )));
    }
    Ok(())
}
