//! Crawl report
//!
//! Counters gathered by the engine during a crawl, and a plain-text
//! rendering of them for the CLI.

use crate::crawler::intent::IntentKind;
use crate::crawler::window::WindowSummary;
use crate::session::CredentialState;
use chrono::{DateTime, Utc};

/// End-of-crawl view of one credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSummary {
    pub label: String,
    pub state: CredentialState,
    pub requests: u64,
    pub cooldown_cycles: u32,

    /// Bound proxy, password masked
    pub proxy: Option<String>,
}

/// Crawl statistics summary
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Reason given to the final request-count flush
    pub stop_reason: Option<String>,

    pub listing_requests: u64,
    pub detail_requests: u64,
    pub long_text_requests: u64,
    pub reply_requests: u64,

    pub auth_failures: u64,
    pub network_failures: u64,

    /// Non-2xx responses other than 401/403
    pub http_errors: u64,

    /// Bodies the classifier rejected
    pub malformed: u64,

    pub retries: u64,

    /// Units of work given up after their budget ran out
    pub abandoned: u64,

    pub items_emitted: u64,
    pub anonymous_requests: u64,

    pub windows: Vec<WindowSummary>,
    pub credentials: Vec<CredentialSummary>,
}

impl CrawlReport {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            started_at: Utc::now(),
            finished_at: None,
            stop_reason: None,
            listing_requests: 0,
            detail_requests: 0,
            long_text_requests: 0,
            reply_requests: 0,
            auth_failures: 0,
            network_failures: 0,
            http_errors: 0,
            malformed: 0,
            retries: 0,
            abandoned: 0,
            items_emitted: 0,
            anonymous_requests: 0,
            windows: Vec::new(),
            credentials: Vec::new(),
        }
    }

    /// Counts one dispatched request
    pub fn record_request(&mut self, kind: IntentKind) {
        match kind {
            IntentKind::Listing => self.listing_requests += 1,
            IntentKind::Detail => self.detail_requests += 1,
            IntentKind::LongText => self.long_text_requests += 1,
            IntentKind::Replies => self.reply_requests += 1,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.listing_requests + self.detail_requests + self.long_text_requests + self.reply_requests
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_seconds())
    }
}

/// Prints the report to stdout
pub fn print_report(report: &CrawlReport) {
    println!("=== Crawl Report: {} ===\n", report.mode);

    println!("Overview:");
    if let Some(seconds) = report.duration_seconds() {
        println!("  Duration: {}s", seconds);
    }
    if let Some(reason) = &report.stop_reason {
        println!("  Stopped: {}", reason);
    }
    println!("  Items emitted: {}", report.items_emitted);
    println!("  Units abandoned: {}", report.abandoned);
    println!();

    println!("Requests ({} total):", report.total_requests());
    println!("  Listing: {}", report.listing_requests);
    println!("  Detail: {}", report.detail_requests);
    println!("  Long text: {}", report.long_text_requests);
    println!("  Replies: {}", report.reply_requests);
    println!("  Unauthenticated: {}", report.anonymous_requests);
    println!("  Retries: {}", report.retries);
    println!();

    let failures =
        report.auth_failures + report.network_failures + report.http_errors + report.malformed;
    if failures > 0 {
        println!("Failures:");
        println!("  Auth rejected: {}", report.auth_failures);
        println!("  Network: {}", report.network_failures);
        println!("  HTTP errors: {}", report.http_errors);
        println!("  Malformed payloads: {}", report.malformed);
        println!();
    }

    if !report.windows.is_empty() {
        println!("Windows ({}):", report.windows.len());
        for summary in &report.windows {
            println!(
                "  {} {}: {} items ({})",
                summary.key, summary.window, summary.items, summary.reason
            );
        }
        println!();
    }

    if !report.credentials.is_empty() {
        println!("Credentials:");
        for credential in &report.credentials {
            println!(
                "  {}: {} requests, {} (cooldowns: {}){}",
                credential.label,
                credential.requests,
                credential.state,
                credential.cooldown_cycles,
                credential
                    .proxy
                    .as_deref()
                    .map(|proxy| format!(" via {}", proxy))
                    .unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_by_kind() {
        let mut report = CrawlReport::new("keyword");
        report.record_request(IntentKind::Listing);
        report.record_request(IntentKind::Listing);
        report.record_request(IntentKind::Detail);
        report.record_request(IntentKind::Replies);

        assert_eq!(report.listing_requests, 2);
        assert_eq!(report.detail_requests, 1);
        assert_eq!(report.reply_requests, 1);
        assert_eq!(report.total_requests(), 4);
    }

    #[test]
    fn test_duration() {
        let mut report = CrawlReport::new("keyword");
        assert!(report.duration_seconds().is_none());

        report.finished_at = Some(report.started_at + chrono::Duration::seconds(90));
        assert_eq!(report.duration_seconds(), Some(90));
    }
}
