//! Append-only telemetry logs
//!
//! Three line-oriented JSON logs: credential cooldown/retirement events,
//! proxy (re)assignments, and per-credential request counts. Without a
//! telemetry directory the events only go to tracing.

use crate::session::{redact_proxy, HealthTransition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

pub const COOLDOWN_LOG: &str = "cooldown.log";
pub const ASSIGNMENT_LOG: &str = "proxy_assignments.log";
pub const REQUEST_COUNT_LOG: &str = "request_counts.log";

#[derive(Debug, Serialize)]
struct CooldownEvent<'a> {
    timestamp: DateTime<Utc>,
    credential: &'a str,
    state: &'a str,
    cycle: u32,
    streak: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct AssignmentEvent<'a> {
    timestamp: DateTime<Utc>,
    credential: &'a str,
    proxy: String,
}

#[derive(Debug, Serialize)]
struct RequestCountEvent<'a> {
    timestamp: DateTime<Utc>,
    reason: &'a str,
    counts: &'a BTreeMap<String, u64>,
    anonymous: u64,
}

#[derive(Debug)]
struct TelemetryFiles {
    cooldown: BufWriter<File>,
    assignments: BufWriter<File>,
    request_counts: BufWriter<File>,
}

/// Writer for the telemetry logs
#[derive(Debug, Default)]
pub struct TelemetryLog {
    files: Option<TelemetryFiles>,
}

impl TelemetryLog {
    /// A log that only emits tracing events
    pub fn disabled() -> Self {
        Self { files: None }
    }

    /// Opens (appending) the three log files inside `directory`
    pub fn open(directory: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(directory)?;
        let append = |name: &str| -> std::io::Result<BufWriter<File>> {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(directory.join(name))?;
            Ok(BufWriter::new(file))
        };

        Ok(Self {
            files: Some(TelemetryFiles {
                cooldown: append(COOLDOWN_LOG)?,
                assignments: append(ASSIGNMENT_LOG)?,
                request_counts: append(REQUEST_COUNT_LOG)?,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.files.is_some()
    }

    /// Records a cooldown or retirement; `Unchanged` writes nothing
    pub fn record_health(
        &mut self,
        credential: &str,
        transition: &HealthTransition,
        now: DateTime<Utc>,
    ) {
        let event = match *transition {
            HealthTransition::Unchanged => return,
            HealthTransition::Cooldown {
                until,
                cycle,
                streak,
            } => CooldownEvent {
                timestamp: now,
                credential,
                state: "cooldown",
                cycle,
                streak,
                until: Some(until),
            },
            HealthTransition::Retired { cycles, streak } => CooldownEvent {
                timestamp: now,
                credential,
                state: "retired",
                cycle: cycles,
                streak,
                until: None,
            },
        };

        if let Some(files) = self.files.as_mut() {
            write_line(&mut files.cooldown, COOLDOWN_LOG, &event);
        }
    }

    /// Records a proxy (re)assignment; the proxy password is masked
    pub fn record_assignment(&mut self, credential: &str, proxy: &str, now: DateTime<Utc>) {
        let event = AssignmentEvent {
            timestamp: now,
            credential,
            proxy: redact_proxy(proxy),
        };

        if let Some(files) = self.files.as_mut() {
            write_line(&mut files.assignments, ASSIGNMENT_LOG, &event);
        }
    }

    /// Records a snapshot of per-credential request counters
    pub fn record_request_counts(
        &mut self,
        reason: &str,
        counts: &BTreeMap<String, u64>,
        anonymous: u64,
        now: DateTime<Utc>,
    ) {
        tracing::info!(reason, ?counts, anonymous, "Credential request counts");

        let event = RequestCountEvent {
            timestamp: now,
            reason,
            counts,
            anonymous,
        };

        if let Some(files) = self.files.as_mut() {
            write_line(&mut files.request_counts, REQUEST_COUNT_LOG, &event);
        }
    }

    /// Final flush at teardown
    ///
    /// Events are already on disk once recorded; this catches anything a
    /// failed per-event flush left behind.
    pub fn flush(&mut self) {
        if let Some(files) = self.files.as_mut() {
            for (name, writer) in [
                (COOLDOWN_LOG, &mut files.cooldown),
                (ASSIGNMENT_LOG, &mut files.assignments),
                (REQUEST_COUNT_LOG, &mut files.request_counts),
            ] {
                if let Err(e) = writer.flush() {
                    tracing::warn!(log = name, error = %e, "Failed to flush telemetry log");
                }
            }
        }
    }
}

/// Writes one event and pushes it to disk
///
/// Telemetry failures never stop a crawl; they are logged and dropped.
fn write_line<T: Serialize>(writer: &mut BufWriter<File>, name: &str, event: &T) {
    let result = serde_json::to_string(event)
        .map_err(std::io::Error::from)
        .and_then(|line| writeln!(writer, "{}", line))
        .and_then(|_| writer.flush());
    if let Err(e) = result {
        tracing::warn!(log = name, error = %e, "Failed to write telemetry event");
    }
}
