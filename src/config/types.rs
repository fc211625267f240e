use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration structure for Quota-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default, rename = "credential")]
    pub credentials: Vec<CredentialEntry>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default, rename = "mode")]
    pub modes: Vec<ModeEntry>,
}

impl Config {
    /// Looks up a crawl mode entry by name
    pub fn mode(&self, name: &str) -> Option<&ModeEntry> {
        self.modes.iter().find(|m| m.name == name)
    }
}

/// What the dispatcher does when no credential is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NoCredentialPolicy {
    /// Send the request without credentials (degraded mode)
    #[default]
    Anonymous,
    /// Hold the request until a credential leaves cooldown
    Stall,
}

/// Scheduler loop and lane pacing configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Maximum number of outstanding requests across all lanes
    pub max_in_flight: usize,

    /// Maximum concurrent requests per credential+proxy lane
    pub lane_max_concurrent: usize,

    /// Minimum spacing between request starts on one lane (milliseconds)
    pub lane_min_spacing_ms: u64,

    pub on_no_credential: NoCredentialPolicy,

    pub request_timeout_secs: u64,

    pub user_agent: String,

    pub referer: Option<String>,

    /// Interval between periodic request-count snapshots (0 disables)
    pub count_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            lane_max_concurrent: 1,
            lane_min_spacing_ms: 700,
            on_no_credential: NoCredentialPolicy::Anonymous,
            request_timeout_secs: 30,
            user_agent:
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.13; rv:61.0) Gecko/20100101 Firefox/61.0"
                    .to_string(),
            referer: None,
            count_interval_secs: 600,
        }
    }
}

/// Credential health thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HealthConfig {
    /// Consecutive failures tolerated before a cooldown starts
    pub failure_threshold: u32,

    pub cooldown_secs: u64,

    /// Cooldown cycles after which a credential is retired
    pub max_cooldown_cycles: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown_secs: 300,
            max_cooldown_cycles: 3,
        }
    }
}

/// Named retry budgets and backoff
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    pub search: u32,
    pub api: u32,
    pub long_text: u32,
    pub empty_page: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            search: 3,
            api: 3,
            long_text: 3,
            empty_page: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Shared proxy endpoint template
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_scheme")]
    pub scheme: String,

    pub host: String,

    pub port: u16,

    /// May contain `{session}` and `{label}` placeholders
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,
}

fn default_proxy_scheme() -> String {
    "http".to_string()
}

fn default_rotation_interval() -> u64 {
    1800
}

/// One account in the credential pool
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CredentialEntry {
    pub label: String,

    /// Secret cookie-style token, e.g. `SUB=...; XSRF-TOKEN=...`
    #[serde(default)]
    pub token: Option<String>,

    /// File holding the secret token (read once at load)
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

/// Telemetry log location
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub directory: Option<PathBuf>,
}

/// Harvested item output location
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./output"),
        }
    }
}

/// Kind of crawl handler a mode maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeKind {
    /// Keyword search split into sequential time windows
    WindowedSearch,
    /// Cursor-paginated thread with nested replies
    Threaded,
    /// Page-number pagination until no new items
    FlatList,
    /// One detail fetch per seed id
    Detail,
}

/// A named crawl mode and the handler it maps to
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModeEntry {
    pub name: String,

    pub kind: ModeKind,

    #[serde(default)]
    pub listing_url: Option<String>,

    #[serde(default)]
    pub detail_url: Option<String>,

    #[serde(default)]
    pub long_text_url: Option<String>,

    #[serde(default)]
    pub replies_url: Option<String>,

    /// Query parameter that carries the thread cursor
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,

    /// Seeds used when none are supplied on the command line
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default)]
    pub window: Option<WindowConfig>,

    #[serde(default)]
    pub payload: PayloadConfig,
}

fn default_cursor_param() -> String {
    "max_id".to_string()
}

/// Global range for a windowed search
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WindowConfig {
    pub start: DateTime<Utc>,

    pub end: DateTime<Utc>,

    #[serde(default = "default_step_minutes")]
    pub step_minutes: u32,

    /// chrono format used for `{start}` and `{end}` in the listing URL
    #[serde(default = "default_label_format")]
    pub label_format: String,
}

fn default_step_minutes() -> u32 {
    60
}

fn default_label_format() -> String {
    "%Y-%m-%d-%H".to_string()
}

/// JSON pointers used to read signals out of response payloads
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PayloadConfig {
    /// Array of listed items
    pub items: String,

    /// Item id, relative to one listed item
    pub item_id: String,

    /// Truthy when the server explicitly reports no results
    pub no_results: Option<String>,

    /// Next-page URL, page token, or cursor
    pub next_page: Option<String>,

    /// Truthy, relative to one listed item, when it has nested replies
    pub nested: Option<String>,

    /// Root of the record inside a detail response
    pub record: Option<String>,

    /// Truthy, relative to the record, when the text is truncated
    pub long_text_flag: Option<String>,

    /// Full text inside a long-text response
    pub long_text_content: String,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            items: "/data".to_string(),
            item_id: "/id".to_string(),
            no_results: None,
            next_page: None,
            nested: None,
            record: None,
            long_text_flag: None,
            long_text_content: "/data/longTextContent".to_string(),
        }
    }
}
