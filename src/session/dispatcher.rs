//! Credential selection and request preparation
//!
//! The dispatcher owns the credential pool, the health tracker, the proxy
//! allocator and the lane table. All of it is mutated from the engine loop
//! only, so none of it needs locking.

use crate::config::{Config, EngineConfig, NoCredentialPolicy};
use crate::crawler::fetcher::{OutboundRequest, ProxyOwner};
use crate::crawler::intent::{FetchIntent, RequestContext};
use crate::output::{CredentialSummary, TelemetryLog};
use crate::session::credential::{CredentialState, CredentialStore};
use crate::session::health::{CredentialHealthTracker, Outcome};
use crate::session::lane::{LaneKey, LaneLimits, LaneTable, LaneTicket};
use crate::session::proxy::{redact_proxy, ProxyAllocator};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A request ready for the transport
#[derive(Debug)]
pub struct PreparedRequest {
    /// The intent, with credential, proxy and lane filled in
    pub intent: FetchIntent,

    pub request: OutboundRequest,

    pub ticket: LaneTicket,
}

/// Result of preparing an intent
#[derive(Debug)]
pub enum Preparation {
    Ready(PreparedRequest),

    /// No credential is available and the policy is to stall
    Declined(FetchIntent),
}

/// Attaches credentials and proxies to requests and routes them onto lanes
#[derive(Debug)]
pub struct SessionDispatcher {
    store: CredentialStore,
    health: CredentialHealthTracker,
    proxies: ProxyAllocator,
    lanes: LaneTable,
    cursor: usize,
    policy: NoCredentialPolicy,
    base_headers: Vec<(String, String)>,
    telemetry: TelemetryLog,
    anonymous_requests: u64,
    degraded: bool,
    flushed: bool,
}

impl SessionDispatcher {
    pub fn new(
        store: CredentialStore,
        health: CredentialHealthTracker,
        proxies: ProxyAllocator,
        engine: &EngineConfig,
        telemetry: TelemetryLog,
    ) -> Self {
        let mut base_headers = vec![("User-Agent".to_string(), engine.user_agent.clone())];
        if let Some(referer) = &engine.referer {
            base_headers.push(("Referer".to_string(), referer.clone()));
        }

        if store.is_empty() {
            warn!("No credentials configured, all requests will be unauthenticated");
        }

        Self {
            store,
            health,
            proxies,
            lanes: LaneTable::new(LaneLimits::from_config(engine)),
            cursor: 0,
            policy: engine.on_no_credential,
            base_headers,
            telemetry,
            anonymous_requests: 0,
            degraded: false,
            flushed: false,
        }
    }

    /// Builds the dispatcher: credentials first, then the proxy allocator
    pub fn from_config(config: &Config) -> Result<Self, HarvestError> {
        let store = CredentialStore::from_entries(&config.credentials)?;
        let proxies = ProxyAllocator::from_config(config.proxy.as_ref())?;
        let health = CredentialHealthTracker::from_config(&config.health);
        let telemetry = match &config.telemetry.directory {
            Some(directory) => TelemetryLog::open(directory)?,
            None => TelemetryLog::disabled(),
        };

        info!(
            credentials = store.len(),
            proxy = proxies.is_enabled(),
            "Session dispatcher ready"
        );
        Ok(Self::new(store, health, proxies, &config.engine, telemetry))
    }

    /// Round-robin scan for an available credential, visiting each at most once
    fn select_credential(&mut self, now: DateTime<Utc>) -> Option<usize> {
        let len = self.store.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let available = match self.store.get_mut(index) {
                Some(credential) => self.health.is_available(credential, now),
                None => false,
            };
            if available {
                self.cursor = (index + 1) % len;
                return Some(index);
            }
        }
        None
    }

    /// Picks a credential and proxy for an intent and reserves its lane slot
    ///
    /// `now` drives credential and proxy bookkeeping; `clock` is the
    /// monotonic time the lane schedule is built on.
    pub fn prepare(
        &mut self,
        mut intent: FetchIntent,
        now: DateTime<Utc>,
        clock: Instant,
    ) -> Preparation {
        let mut headers = self.base_headers.clone();
        for (name, value) in &intent.headers {
            set_header(&mut headers, name, value);
        }

        let mut credential_epoch = None;
        let (label, proxy, proxy_owner) = match self.select_credential(now) {
            Some(index) => {
                self.degraded = false;
                let Some(credential) = self.store.get_mut(index) else {
                    return Preparation::Declined(intent);
                };
                credential.request_count += 1;
                credential_epoch = Some(credential.epoch);

                let resolution = self.proxies.ensure_binding(credential, now);
                if let Some(resolution) = &resolution {
                    if resolution.rebound {
                        self.telemetry
                            .record_assignment(&credential.label, &resolution.uri, now);
                    }
                    if let Some(previous) = &resolution.replaced {
                        let retired = LaneKey::new(Some(credential.label.as_str()), Some(previous.as_str()));
                        if self.lanes.remove(&retired).is_some() {
                            debug!(lane = %retired, "Dropped lane of rotated proxy");
                        }
                    }
                }

                for (name, value) in credential.auth_headers() {
                    set_header(&mut headers, &name, &value);
                }
                let owner = credential.proxy.as_ref().map(|binding| ProxyOwner {
                    credential: credential.label.clone(),
                    bound_at: binding.bound_at,
                });
                (
                    Some(credential.label.clone()),
                    resolution.map(|resolution| resolution.uri),
                    owner,
                )
            }
            None => {
                if self.policy == NoCredentialPolicy::Stall && !self.store.is_empty() {
                    debug!(url = %intent.url, "No credential available, holding request");
                    return Preparation::Declined(intent);
                }
                if !self.degraded && !self.store.is_empty() {
                    warn!("No credential available, sending requests unauthenticated");
                }
                self.degraded = true;
                self.anonymous_requests += 1;
                (None, None, None)
            }
        };

        let lane = LaneKey::new(label.as_deref(), proxy.as_deref());
        let ticket = self.lanes.reserve(&lane, clock);

        intent.context.credential = label;
        intent.context.credential_epoch = credential_epoch;
        intent.context.proxy = proxy.clone();
        intent.context.lane = Some(lane);

        let request = OutboundRequest {
            url: intent.url.clone(),
            headers,
            proxy,
            proxy_owner,
        };

        Preparation::Ready(PreparedRequest {
            intent,
            request,
            ticket,
        })
    }

    /// Feeds a request outcome to the health tracker and the request's lane
    pub fn on_outcome(
        &mut self,
        context: &RequestContext,
        outcome: Outcome,
        now: DateTime<Utc>,
        clock: Instant,
    ) {
        if let Some(credential) = context
            .credential
            .as_deref()
            .and_then(|label| self.store.position(label))
            .and_then(|index| self.store.get_mut(index))
        {
            let epoch = context.credential_epoch.unwrap_or(credential.epoch);
            let transition = self.health.record_outcome(credential, outcome, epoch, now);
            self.telemetry
                .record_health(&credential.label, &transition, now);
        }

        if outcome.is_failure() {
            if let Some(lane) = &context.lane {
                self.lanes.penalize(lane, clock);
            }
        }
    }

    /// Earliest moment a cooling credential becomes usable again
    ///
    /// `None` when no credential is cooling down.
    pub fn next_available_at(&self) -> Option<DateTime<Utc>> {
        self.store
            .iter()
            .filter(|credential| credential.state == CredentialState::Cooldown)
            .filter_map(|credential| credential.cooldown_until)
            .min()
    }

    /// True when the pool is non-empty and every credential is retired
    pub fn all_retired(&self) -> bool {
        !self.store.is_empty()
            && self
                .store
                .iter()
                .all(|credential| credential.state.is_terminal())
    }

    pub fn has_active(&self) -> bool {
        self.store
            .iter()
            .any(|credential| credential.state == CredentialState::Active)
    }

    pub fn anonymous_requests(&self) -> u64 {
        self.anonymous_requests
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Writes the per-credential request counters to telemetry
    pub fn snapshot_counts(&mut self, reason: &str, now: DateTime<Utc>) {
        let counts: BTreeMap<String, u64> = self
            .store
            .iter()
            .map(|credential| (credential.label.clone(), credential.request_count))
            .collect();
        self.telemetry
            .record_request_counts(reason, &counts, self.anonymous_requests, now);
    }

    /// Final snapshot and flush; only the first call has any effect
    pub fn flush(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if self.flushed {
            return false;
        }
        self.flushed = true;
        self.snapshot_counts(reason, now);
        self.telemetry.flush();
        true
    }

    pub fn credential_summaries(&self) -> Vec<CredentialSummary> {
        self.store
            .iter()
            .map(|credential| CredentialSummary {
                label: credential.label.clone(),
                state: credential.state,
                requests: credential.request_count,
                cooldown_cycles: credential.cooldown_cycles,
                proxy: credential.proxy_uri().map(redact_proxy),
            })
            .collect()
    }
}

/// Sets a header, replacing any existing value (names compare case-insensitively)
fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers
        .iter_mut()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
    {
        Some(entry) => entry.1 = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::crawler::intent::{IntentKind, Scope};
    use crate::crawler::retry::BudgetTag;
    use crate::session::credential::Credential;
    use chrono::TimeZone;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn intent() -> FetchIntent {
        FetchIntent::new(
            "https://api.example.com/show?id=1",
            IntentKind::Detail,
            BudgetTag::Api,
            Scope::Item {
                seed: "1".to_string(),
                item_id: "1".to_string(),
                origin: None,
            },
        )
    }

    fn dispatcher(labels: &[&str], policy: NoCredentialPolicy) -> SessionDispatcher {
        let store = CredentialStore::new(
            labels
                .iter()
                .map(|label| Credential::new(*label, format!("SUB={}; XSRF-TOKEN=x-{}", label, label)))
                .collect(),
        );
        let engine = EngineConfig {
            on_no_credential: policy,
            referer: Some("https://example.com/".to_string()),
            ..EngineConfig::default()
        };
        SessionDispatcher::new(
            store,
            CredentialHealthTracker::default(),
            ProxyAllocator::disabled(),
            &engine,
            TelemetryLog::disabled(),
        )
    }

    fn ready(preparation: Preparation) -> PreparedRequest {
        match preparation {
            Preparation::Ready(prepared) => prepared,
            Preparation::Declined(_) => panic!("expected a ready request"),
        }
    }

    fn retire(dispatcher: &mut SessionDispatcher, label: &str) {
        let index = dispatcher.store.position(label).unwrap();
        dispatcher.store.get_mut(index).unwrap().state = CredentialState::Retired;
    }

    fn header<'a>(request: &'a OutboundRequest, name: &str) -> Option<&'a str> {
        request
            .headers
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn test_round_robin_selection() {
        let mut dispatcher = dispatcher(&["a", "b", "c"], NoCredentialPolicy::Anonymous);
        let clock = Instant::now();

        let labels: Vec<String> = (0..4)
            .map(|_| {
                ready(dispatcher.prepare(intent(), start(), clock))
                    .intent
                    .context
                    .credential
                    .unwrap()
            })
            .collect();
        assert_eq!(labels, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_selection_skips_unavailable() {
        let mut dispatcher = dispatcher(&["a", "b", "c"], NoCredentialPolicy::Anonymous);
        let clock = Instant::now();
        retire(&mut dispatcher, "b");
        let index = dispatcher.store.position("c").unwrap();
        let cooling = dispatcher.store.get_mut(index).unwrap();
        cooling.state = CredentialState::Cooldown;
        cooling.cooldown_until = Some(start() + chrono::Duration::minutes(5));

        for _ in 0..5 {
            let prepared = ready(dispatcher.prepare(intent(), start(), clock));
            assert_eq!(prepared.intent.context.credential.as_deref(), Some("a"));
        }
    }

    #[test]
    fn test_headers_attached() {
        let mut dispatcher = dispatcher(&["a"], NoCredentialPolicy::Anonymous);
        let prepared = ready(dispatcher.prepare(
            intent().with_header("referer", "https://override.example.com/"),
            start(),
            Instant::now(),
        ));

        let request = &prepared.request;
        assert_eq!(header(request, "Cookie"), Some("SUB=a; XSRF-TOKEN=x-a"));
        assert_eq!(header(request, "X-XSRF-TOKEN"), Some("x-a"));
        assert_eq!(header(request, "Referer"), Some("https://override.example.com/"));
        assert!(header(request, "User-Agent").is_some());
        assert_eq!(dispatcher.store.get(0).unwrap().request_count, 1);
    }

    #[test]
    fn test_anonymous_when_none_available() {
        let mut dispatcher = dispatcher(&["a"], NoCredentialPolicy::Anonymous);
        retire(&mut dispatcher, "a");

        let prepared = ready(dispatcher.prepare(intent(), start(), Instant::now()));
        assert!(prepared.intent.context.credential.is_none());
        assert_eq!(prepared.intent.context.lane, Some(LaneKey::anonymous()));
        assert!(header(&prepared.request, "Cookie").is_none());
        assert_eq!(dispatcher.anonymous_requests(), 1);
        assert!(dispatcher.all_retired());
    }

    #[test]
    fn test_stall_declines_when_none_available() {
        let mut dispatcher = dispatcher(&["a"], NoCredentialPolicy::Stall);
        let index = dispatcher.store.position("a").unwrap();
        let cooling = dispatcher.store.get_mut(index).unwrap();
        cooling.state = CredentialState::Cooldown;
        let until = start() + chrono::Duration::minutes(5);
        cooling.cooldown_until = Some(until);

        assert!(matches!(
            dispatcher.prepare(intent(), start(), Instant::now()),
            Preparation::Declined(_)
        ));
        assert_eq!(dispatcher.next_available_at(), Some(until));

        let later = until + chrono::Duration::seconds(1);
        let prepared = ready(dispatcher.prepare(intent(), later, Instant::now()));
        assert_eq!(prepared.intent.context.credential.as_deref(), Some("a"));
    }

    #[test]
    fn test_lane_pacing_per_credential() {
        let mut dispatcher = dispatcher(&["a", "b"], NoCredentialPolicy::Anonymous);
        let clock = Instant::now();

        let a1 = ready(dispatcher.prepare(intent(), start(), clock));
        let b1 = ready(dispatcher.prepare(intent(), start(), clock));
        let a2 = ready(dispatcher.prepare(intent(), start(), clock));

        assert_eq!(a1.ticket.send_at, clock);
        assert_eq!(b1.ticket.send_at, clock);
        assert_eq!(a2.ticket.send_at, clock + Duration::from_millis(700));
        assert_eq!(dispatcher.lane_count(), 2);
    }

    #[test]
    fn test_backoff_does_not_push_lane_schedule() {
        let mut dispatcher = dispatcher(&["a"], NoCredentialPolicy::Anonymous);
        let clock = Instant::now();
        let mut delayed = intent();
        delayed.backoff = Duration::from_secs(30);

        let first = ready(dispatcher.prepare(delayed, start(), clock));
        let second = ready(dispatcher.prepare(intent(), start(), clock));
        assert_eq!(first.ticket.send_at, clock);
        assert_eq!(second.ticket.send_at, clock + Duration::from_millis(700));
    }

    #[test]
    fn test_outcomes_drive_cooldown() {
        let mut dispatcher = dispatcher(&["a", "b"], NoCredentialPolicy::Anonymous);
        let clock = Instant::now();
        let prepared = ready(dispatcher.prepare(intent(), start(), clock));
        let context = prepared.intent.context;
        assert_eq!(context.credential.as_deref(), Some("a"));

        for _ in 0..11 {
            dispatcher.on_outcome(&context, Outcome::AuthFailure, start(), clock);
        }

        assert_eq!(dispatcher.store.get(0).unwrap().state, CredentialState::Cooldown);
        // Stragglers from the same burst do not start a second cycle
        for _ in 0..11 {
            dispatcher.on_outcome(&context, Outcome::AuthFailure, start(), clock);
        }
        assert_eq!(dispatcher.store.get(0).unwrap().cooldown_cycles, 1);
        for _ in 0..3 {
            let prepared = ready(dispatcher.prepare(intent(), start(), clock));
            assert_eq!(prepared.intent.context.credential.as_deref(), Some("b"));
        }
    }

    #[test]
    fn test_proxy_attached_to_lane() {
        let proxy = ProxyConfig {
            scheme: "http".to_string(),
            host: "proxy.example.com".to_string(),
            port: 8000,
            username: Some("user-{label}".to_string()),
            password: Some("pw".to_string()),
            rotation_interval_secs: 1800,
        };
        let mut dispatcher = SessionDispatcher::new(
            CredentialStore::new(vec![Credential::new("a", "SUB=1")]),
            CredentialHealthTracker::default(),
            ProxyAllocator::from_config(Some(&proxy)).unwrap(),
            &EngineConfig::default(),
            TelemetryLog::disabled(),
        );

        let prepared = ready(dispatcher.prepare(intent(), start(), Instant::now()));
        let uri = prepared.request.proxy.clone().unwrap();
        assert_eq!(uri, "http://user-a:pw@proxy.example.com:8000/");
        assert_eq!(
            prepared.intent.context.lane,
            Some(LaneKey::new(Some("a"), Some(uri.as_str())))
        );
    }

    #[test]
    fn test_rotation_replaces_lane() {
        let proxy = ProxyConfig {
            scheme: "http".to_string(),
            host: "proxy.example.com".to_string(),
            port: 8000,
            username: Some("user-{label}-session-{session}".to_string()),
            password: Some("pw".to_string()),
            rotation_interval_secs: 1800,
        };
        let mut dispatcher = SessionDispatcher::new(
            CredentialStore::new(vec![Credential::new("a", "SUB=1")]),
            CredentialHealthTracker::default(),
            ProxyAllocator::from_config(Some(&proxy)).unwrap(),
            &EngineConfig::default(),
            TelemetryLog::disabled(),
        );
        let clock = Instant::now();

        let mut owners = Vec::new();
        for rotation in 0..48 {
            let now = start() + chrono::Duration::minutes(30 * rotation);
            let prepared = ready(dispatcher.prepare(intent(), now, clock));
            owners.push(prepared.request.proxy_owner.unwrap());
        }

        assert_eq!(dispatcher.lane_count(), 1);
        assert_eq!(owners[0].credential, "a");
        assert_eq!(owners[47].bound_at, start() + chrono::Duration::minutes(30 * 47));
    }

    #[test]
    fn test_flush_only_once() {
        let mut dispatcher = dispatcher(&["a"], NoCredentialPolicy::Anonymous);
        assert!(dispatcher.flush("shutdown", start()));
        assert!(!dispatcher.flush("engine-stopped", start()));
    }

    #[test]
    fn test_set_header_replaces_case_insensitively() {
        let mut headers = vec![("User-Agent".to_string(), "a".to_string())];
        set_header(&mut headers, "user-agent", "b");
        set_header(&mut headers, "Accept", "*/*");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].1, "b");
    }
}
