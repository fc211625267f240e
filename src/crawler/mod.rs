//! Crawler module: intents, modes, and the engine loop
//!
//! This module contains the crawl logic, including:
//! - Typed fetch intents and request context
//! - Named retry budgets with backoff
//! - Time-window scheduling and pagination dedup
//! - Payload classification and the crawl modes built on it
//! - HTTP transport and the coordinating engine loop

mod coordinator;
pub mod fetcher;
pub mod intent;
pub mod modes;
pub mod pagination;
pub mod parser;
pub mod retry;
pub mod seeds;
pub mod template;
pub mod window;

pub use coordinator::{Coordinator, REASON_PERIODIC, REASON_SHUTDOWN, REASON_STOPPED};
pub use fetcher::{
    build_http_client, classify_status, HttpTransport, OutboundRequest, ProxyOwner, StatusClass,
    Transport, TransportError, TransportErrorKind, TransportResponse,
};
pub use intent::{FetchIntent, IntentKind, RequestContext, Scope, WindowRef};
pub use modes::{CrawlMode, ModeFactory, ModeRegistry, ModeTools, Step};
pub use pagination::{PageObservation, PaginationDedupTracker, SubLevel, TargetKey};
pub use parser::{ClassifyError, JsonPointerClassifier, PayloadClassifier};
pub use retry::{BudgetTag, RetryBudgetController, RetryCounters, RetryDecision};
pub use seeds::load_seeds;
pub use window::{TimeWindow, TimeWindowScheduler, WindowSummary};

use crate::config::Config;
use crate::output::{CrawlReport, ItemSink};
use crate::Result;
use std::future::Future;

/// Runs a complete crawl of one mode
///
/// # Arguments
///
/// * `config` - The validated configuration
/// * `mode` - Name of a `[[mode]]` entry
/// * `seeds` - Seed ids handed to the mode
/// * `sink` - Destination for harvested items
/// * `shutdown` - Resolves when the crawl should stop issuing requests
///
/// # Returns
///
/// * `Ok(CrawlReport)` - The crawl ran to completion or was shut down
/// * `Err(HarvestError)` - Startup failed or the sink could not be written
pub async fn crawl<F>(
    config: &Config,
    mode: &str,
    seeds: &[String],
    sink: Box<dyn ItemSink>,
    shutdown: F,
) -> Result<CrawlReport>
where
    F: Future<Output = ()>,
{
    let mut coordinator = Coordinator::from_config(config, mode, sink)?;
    coordinator.seed(seeds);
    coordinator.run(shutdown).await
}
