//! Integration tests for the crawl engine
//!
//! The windowed-search tests use wiremock to serve a listing API and drive
//! the real HTTP transport end-to-end. Credential and proxy scenarios use an
//! in-process transport that answers according to the credential or proxy a
//! request was sent with.

use async_trait::async_trait;
use quota_harvest::config::{parse_config, Config};
use quota_harvest::crawler::{
    Coordinator, ModeRegistry, OutboundRequest, Transport, TransportError, TransportResponse,
};
use quota_harvest::output::{HarvestedItem, ItemSink, JsonlSink, MemorySink};
use quota_harvest::session::{CredentialState, SessionDispatcher};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Common engine settings: no pacing, near-instant retries
const ENGINE: &str = r#"
[engine]
lane-min-spacing-ms = 0
count-interval-secs = 0

[retry]
base-delay-ms = 1
max-delay-ms = 1
"#;

fn windowed_config(server: &str, extra: &str) -> Config {
    let content = format!(
        r#"{ENGINE}
{extra}

[[credential]]
label = "a"
token = "SUB=abc; XSRF-TOKEN=tok-a"

[[mode]]
name = "keyword"
kind = "windowed-search"
listing-url = "{server}/search?q={{key}}&start={{start}}&end={{end}}&page={{page}}"

[mode.window]
start = "2025-01-01T00:00:00Z"
end = "2025-01-01T03:00:00Z"
step-minutes = 60

[mode.payload]
items = "/data/list"
no-results = "/data/noResult"
next-page = "/data/next"
"#
    );
    parse_config(&content).expect("valid config")
}

fn listing(ids: std::ops::Range<u32>, next: Value) -> Value {
    let list: Vec<Value> = ids.map(|id| json!({"id": format!("M{}", id)})).collect();
    json!({"data": {"list": list, "next": next}})
}

async fn mount_window(server: &MockServer, start: &str, page: &str, body: Value, times: u64) {
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("start", start))
        .and(query_param("page", page))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_window_paginates_until_no_new_items() {
    let server = MockServer::start().await;
    let config = windowed_config(&server.uri(), "");

    // Page 1: 20 items and a next page; page 2: the same 20 ids, no next page
    mount_window(&server, "2025-01-01-00", "1", listing(0..20, json!(2)), 1).await;
    mount_window(&server, "2025-01-01-00", "2", listing(0..20, Value::Null), 1).await;
    for start in ["2025-01-01-01", "2025-01-01-02"] {
        mount_window(&server, start, "1", json!({"data": {"noResult": true}}), 1).await;
    }

    let sink = MemorySink::new();
    let mut coordinator =
        Coordinator::from_config(&config, "keyword", Box::new(sink.clone())).unwrap();
    coordinator.seed(&["rust".to_string()]);
    let report = coordinator.run_to_completion().await.unwrap();

    assert_eq!(report.listing_requests, 4);
    assert_eq!(report.items_emitted, 20);
    assert_eq!(sink.len(), 20);
    assert!(sink.items().iter().all(|item| item.seed == "rust"));

    let first = &report.windows[0];
    assert_eq!(first.key, "rust");
    assert_eq!(first.window.index, 0);
    assert_eq!(first.items, 20);
    assert_eq!(first.reason, "no-next-page");

    assert_eq!(report.windows.len(), 3);
    assert_eq!(report.windows[1].reason, "no-results");
    assert_eq!(report.windows[2].reason, "no-results");

    assert_eq!(report.credentials[0].requests, 4);
    assert_eq!(report.credentials[0].state, CredentialState::Active);
}

#[tokio::test]
async fn test_requests_carry_credential_headers() {
    let server = MockServer::start().await;
    let config = windowed_config(&server.uri(), "");

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(header("Cookie", "SUB=abc; XSRF-TOKEN=tok-a"))
        .and(header("X-XSRF-TOKEN", "tok-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"noResult": true}})))
        .expect(3)
        .mount(&server)
        .await;

    let mut coordinator =
        Coordinator::from_config(&config, "keyword", Box::new(MemorySink::new())).unwrap();
    coordinator.seed(&["rust".to_string()]);
    let report = coordinator.run_to_completion().await.unwrap();

    assert_eq!(report.listing_requests, 3);
    assert_eq!(report.abandoned, 0);
}

#[tokio::test]
async fn test_failing_window_is_abandoned_and_next_starts() {
    let server = MockServer::start().await;
    let config = windowed_config(&server.uri(), "");

    // First window always fails: 1 attempt + 3 retries, then abandoned
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("start", "2025-01-01-00"))
        .respond_with(ResponseTemplate::new(502))
        .expect(4)
        .mount(&server)
        .await;
    for start in ["2025-01-01-01", "2025-01-01-02"] {
        mount_window(&server, start, "1", json!({"data": {"noResult": true}}), 1).await;
    }

    let mut coordinator =
        Coordinator::from_config(&config, "keyword", Box::new(MemorySink::new())).unwrap();
    coordinator.seed(&["rust".to_string()]);
    let report = coordinator.run_to_completion().await.unwrap();

    assert_eq!(report.http_errors, 4);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.windows[0].reason, "abandoned");
    assert_eq!(report.windows.len(), 3);
}

#[tokio::test]
async fn test_items_written_as_json_lines() {
    let server = MockServer::start().await;
    let config = windowed_config(&server.uri(), "");
    let output = TempDir::new().unwrap();

    mount_window(&server, "2025-01-01-00", "1", listing(0..3, Value::Null), 1).await;
    for start in ["2025-01-01-01", "2025-01-01-02"] {
        mount_window(&server, start, "1", json!({"data": {"noResult": true}}), 1).await;
    }

    let seeds = vec!["rust".to_string()];
    let sink = JsonlSink::create(output.path(), "keyword", &seeds).unwrap();
    let path = sink.path().to_path_buf();
    let mut coordinator = Coordinator::from_config(&config, "keyword", Box::new(sink)).unwrap();
    coordinator.seed(&seeds);
    coordinator.run_to_completion().await.unwrap();

    assert_eq!(path.file_name().unwrap(), "keyword_rust.jsonl");
    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["seed"], "rust");
    assert_eq!(lines[0]["record"]["id"], "M0");
    assert!(lines[0]["crawl_time"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_telemetry_flushed_once_on_stop() {
    let server = MockServer::start().await;
    let telemetry = TempDir::new().unwrap();
    let extra = format!(
        "[telemetry]\ndirectory = {:?}\n",
        telemetry.path().display().to_string()
    );
    let config = windowed_config(&server.uri(), &extra);

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"noResult": true}})))
        .mount(&server)
        .await;

    let mut coordinator =
        Coordinator::from_config(&config, "keyword", Box::new(MemorySink::new())).unwrap();
    coordinator.seed(&["rust".to_string()]);
    coordinator.run_to_completion().await.unwrap();

    let counts =
        std::fs::read_to_string(telemetry.path().join("request_counts.log")).unwrap();
    let lines: Vec<Value> = counts
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["reason"], "engine-stopped");
    assert_eq!(lines[0]["counts"]["a"], 3);
}

/// Answers detail lookups; requests from `rejected` labels get a 403
#[derive(Debug, Default)]
struct ScriptedApi {
    rejected: Vec<&'static str>,
    seen: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedApi {
    fn rejecting(rejected: Vec<&'static str>) -> Self {
        Self {
            rejected,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<OutboundRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedApi {
    async fn execute(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());

        let cookie = request
            .headers
            .iter()
            .find(|(name, _)| name == "Cookie")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        if self
            .rejected
            .iter()
            .any(|label| cookie == format!("SUB={}", label))
        {
            return Ok(TransportResponse {
                status: 403,
                body: Vec::new(),
            });
        }

        let id = request.url.rsplit('=').next().unwrap_or_default().to_string();
        Ok(TransportResponse {
            status: 200,
            body: serde_json::to_vec(&json!({"data": {"id": id}})).unwrap(),
        })
    }
}

fn detail_config(extra: &str) -> Config {
    let content = format!(
        r#"{ENGINE}
{extra}

[health]
failure-threshold = 1
cooldown-secs = 300

[[credential]]
label = "a"
token = "SUB=a"

[[credential]]
label = "b"
token = "SUB=b"

[[mode]]
name = "tweet"
kind = "detail"
detail-url = "https://api.example.com/show?id={{id}}"

[mode.payload]
record = "/data"
"#
    );
    parse_config(&content).expect("valid config")
}

fn scripted_coordinator(config: &Config, api: Arc<ScriptedApi>, sink: MemorySink) -> Coordinator {
    let dispatcher = SessionDispatcher::from_config(config).unwrap();
    let mode = ModeRegistry::from_config(config).build("tweet").unwrap();
    Coordinator::new(config, dispatcher, mode, api, Box::new(sink))
}

#[tokio::test]
async fn test_rejected_credential_cools_down_and_work_moves_on() {
    let config = detail_config("");
    let api = Arc::new(ScriptedApi::rejecting(vec!["a"]));
    let sink = MemorySink::new();
    let mut coordinator = scripted_coordinator(&config, Arc::clone(&api), sink.clone());

    let seeds: Vec<String> = (1..=4).map(|n| format!("X{}", n)).collect();
    coordinator.seed(&seeds);
    let report = coordinator.run_to_completion().await.unwrap();

    // Every item eventually arrives through the healthy credential
    assert_eq!(report.items_emitted, 4);
    let mut ids: Vec<String> = sink
        .items()
        .iter()
        .map(|item| item.record["id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, seeds);

    let a = &report.credentials[0];
    assert_eq!(a.label, "a");
    assert_eq!(a.state, CredentialState::Cooldown);
    assert_eq!(a.cooldown_cycles, 1);
    assert!(report.auth_failures >= 2);

    let b = &report.credentials[1];
    assert_eq!(b.state, CredentialState::Active);
    assert_eq!(b.requests, 4);
}

#[tokio::test]
async fn test_stall_policy_holds_until_cooldown_expires() {
    let mut config = detail_config("");
    config.engine.on_no_credential = quota_harvest::config::NoCredentialPolicy::Stall;
    config.health.cooldown_secs = 1;
    config.credentials.truncate(1);
    let api = Arc::new(ScriptedApi::rejecting(vec!["a"]));
    let mut coordinator = scripted_coordinator(&config, Arc::clone(&api), MemorySink::new());

    coordinator.seed(&["X1".to_string()]);
    let started = std::time::Instant::now();
    let report = coordinator.run_to_completion().await.unwrap();

    // Two failures cool the only credential down; the third attempt waits for
    // it instead of going out unauthenticated, then the budget runs out
    assert!(started.elapsed() >= std::time::Duration::from_millis(900));
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.anonymous_requests, 0);
    assert_eq!(api.seen().len(), 4);
    assert!(api
        .seen()
        .iter()
        .all(|request| request.headers.iter().any(|(name, _)| name == "Cookie")));
}

#[tokio::test]
async fn test_proxy_binding_is_sticky_per_credential() {
    let telemetry = TempDir::new().unwrap();
    let extra = format!(
        r#"[telemetry]
directory = {:?}

[proxy]
host = "proxy.example.com"
port = 8000
username = "user-{{label}}-session-{{session}}"
password = "secret"
rotation-interval-secs = 1800
"#,
        telemetry.path().display().to_string()
    );
    let mut config = detail_config(&extra);
    config.credentials.truncate(1);
    let api = Arc::new(ScriptedApi::default());
    let mut coordinator = scripted_coordinator(&config, Arc::clone(&api), MemorySink::new());

    coordinator.seed(&["X1".to_string(), "X2".to_string(), "X3".to_string()]);
    let report = coordinator.run_to_completion().await.unwrap();
    assert_eq!(report.items_emitted, 3);

    let proxies: Vec<String> = api
        .seen()
        .iter()
        .map(|request| request.proxy.clone().expect("proxied request"))
        .collect();
    assert_eq!(proxies.len(), 3);
    assert!(proxies.iter().all(|proxy| proxy == &proxies[0]));
    assert!(proxies[0].starts_with("http://user-a-session-"));
    assert!(proxies[0].contains(":secret@proxy.example.com:8000"));

    // One assignment event, password masked
    let assignments =
        std::fs::read_to_string(telemetry.path().join("proxy_assignments.log")).unwrap();
    assert_eq!(assignments.lines().count(), 1);
    assert!(!assignments.contains("secret"));

    let summary = report.credentials[0].proxy.as_deref().unwrap();
    assert!(summary.contains("***"));
}

/// Sink that fails on first write
#[derive(Debug)]
struct BrokenSink;

impl ItemSink for BrokenSink {
    fn accept(&mut self, _item: HarvestedItem) -> quota_harvest::output::OutputResult<()> {
        Err(quota_harvest::output::OutputError::Write("disk full".to_string()))
    }

    fn flush(&mut self) -> quota_harvest::output::OutputResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_sink_failure_stops_the_crawl() {
    let config = detail_config("");
    let api = Arc::new(ScriptedApi::default());
    let dispatcher = SessionDispatcher::from_config(&config).unwrap();
    let mode = ModeRegistry::from_config(&config).build("tweet").unwrap();
    let mut coordinator = Coordinator::new(&config, dispatcher, mode, api, Box::new(BrokenSink));

    coordinator.seed(&["X1".to_string()]);
    let err = coordinator.run_to_completion().await.unwrap_err();
    assert!(err.to_string().contains("disk full"));
}
