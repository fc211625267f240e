//! Output module for harvested items, telemetry, and crawl reports
//!
//! This module handles:
//! - Writing harvested items (JSON Lines files or memory)
//! - Append-only telemetry logs for credential and proxy events
//! - The end-of-crawl report

mod jsonl;
pub mod stats;
pub mod telemetry;
mod traits;

pub use jsonl::{output_file_name, JsonlSink, MemorySink};
pub use stats::{print_report, CrawlReport, CredentialSummary};
pub use telemetry::TelemetryLog;
pub use traits::{HarvestedItem, ItemSink, OutputError, OutputResult};
