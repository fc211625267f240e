//! Crawler coordinator - the engine loop
//!
//! This module owns every piece of crawl state and drives it from one task:
//! - Consuming the intent queue in FIFO order
//! - Handing intents to the session dispatcher for credentials and lanes
//! - Keeping at most `max-in-flight` requests outstanding
//! - Classifying responses into outcomes, retries and abandonment
//! - Feeding successful pages to the crawl mode
//! - Periodic and final request-count snapshots

use crate::config::Config;
use crate::crawler::fetcher::{
    classify_status, HttpTransport, StatusClass, Transport, TransportError, TransportErrorKind,
    TransportResponse,
};
use crate::crawler::intent::FetchIntent;
use crate::crawler::modes::{CrawlMode, ModeRegistry, ModeTools, Step};
use crate::crawler::retry::{RetryBudgetController, RetryDecision};
use crate::output::{CrawlReport, ItemSink};
use crate::session::{Outcome, Preparation, PreparedRequest, SessionDispatcher};
use crate::Result;
use chrono::Utc;
use std::collections::VecDeque;
use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Flush reason for a crawl that ran out of work
pub const REASON_STOPPED: &str = "engine-stopped";

/// Flush reason for a crawl interrupted by the shutdown signal
pub const REASON_SHUTDOWN: &str = "shutdown";

/// Snapshot reason for the periodic request-count log
pub const REASON_PERIODIC: &str = "periodic";

/// A finished request, returned by its task
#[derive(Debug)]
struct Completion {
    intent: FetchIntent,
    result: std::result::Result<TransportResponse, TransportError>,
}

/// Main crawler coordinator structure
pub struct Coordinator {
    dispatcher: SessionDispatcher,
    retry: RetryBudgetController,
    mode: Box<dyn CrawlMode>,
    transport: Arc<dyn Transport>,
    sink: Box<dyn ItemSink>,
    queue: VecDeque<FetchIntent>,

    /// Retries waiting out their backoff, with the time they become due
    delayed: Vec<(Instant, FetchIntent)>,
    max_in_flight: usize,
    count_interval: Option<Duration>,
    report: CrawlReport,
}

impl Coordinator {
    /// Creates a coordinator for one configured crawl mode
    ///
    /// Components are built in order: credentials, proxy allocator,
    /// dispatcher, mode, transport.
    ///
    /// # Arguments
    ///
    /// * `config` - The validated configuration
    /// * `mode_name` - Name of a `[[mode]]` entry
    /// * `sink` - Destination for harvested items
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Ready to be seeded and run
    /// * `Err(HarvestError)` - Unknown mode, unreadable token file, bad proxy,
    ///   or the HTTP client could not be built
    pub fn from_config(config: &Config, mode_name: &str, sink: Box<dyn ItemSink>) -> Result<Self> {
        Self::with_registry(config, &ModeRegistry::from_config(config), mode_name, sink)
    }

    /// Like [`Coordinator::from_config`], with a caller-supplied mode registry
    pub fn with_registry(
        config: &Config,
        registry: &ModeRegistry,
        mode_name: &str,
        sink: Box<dyn ItemSink>,
    ) -> Result<Self> {
        let dispatcher = SessionDispatcher::from_config(config)?;
        let mode = registry.build(mode_name)?;
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(
            config.engine.request_timeout_secs,
        ))?);

        Ok(Self::new(config, dispatcher, mode, transport, sink))
    }

    /// Assembles a coordinator from already-built parts
    pub fn new(
        config: &Config,
        dispatcher: SessionDispatcher,
        mode: Box<dyn CrawlMode>,
        transport: Arc<dyn Transport>,
        sink: Box<dyn ItemSink>,
    ) -> Self {
        let count_interval = match config.engine.count_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Self {
            dispatcher,
            retry: RetryBudgetController::from_config(&config.retry),
            report: CrawlReport::new(mode.name()),
            mode,
            transport,
            sink,
            queue: VecDeque::new(),
            delayed: Vec::new(),
            max_in_flight: config.engine.max_in_flight.max(1),
            count_interval,
        }
    }

    /// Queues the mode's initial intents for the given seed ids
    pub fn seed(&mut self, ids: &[String]) -> usize {
        let intents = self.mode.seed(ids);
        let count = intents.len();
        self.queue.extend(intents);
        info!(seeds = ids.len(), intents = count, "Seeded crawl");
        count
    }

    /// Queues one intent directly
    pub fn enqueue(&mut self, intent: FetchIntent) {
        self.queue.push_back(intent);
    }

    /// Intents waiting to be dispatched, backed-off retries included
    pub fn queued(&self) -> usize {
        self.queue.len() + self.delayed.len()
    }

    pub fn dispatcher(&self) -> &SessionDispatcher {
        &self.dispatcher
    }

    /// Runs until the queue drains or `shutdown` resolves
    ///
    /// On shutdown no new requests are issued; requests already in flight are
    /// allowed to finish and their results are processed. Request counts are
    /// flushed exactly once either way.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<CrawlReport>
    where
        F: Future<Output = ()>,
    {
        info!(
            mode = self.mode.name(),
            queued = self.queue.len(),
            max_in_flight = self.max_in_flight,
            "Starting crawl"
        );

        let outcome = self.drive(shutdown).await;
        let interrupted = matches!(outcome, Ok(true));
        let reason = if interrupted { REASON_SHUTDOWN } else { REASON_STOPPED };

        self.dispatcher.flush(reason, Utc::now());
        let flushed = self.sink.flush();

        self.report.finished_at = Some(Utc::now());
        self.report.stop_reason = Some(reason.to_string());
        self.report.anonymous_requests = self.dispatcher.anonymous_requests();
        self.report.windows = self.mode.window_summaries();
        self.report.credentials = self.dispatcher.credential_summaries();

        outcome?;
        flushed?;

        info!(
            requests = self.report.total_requests(),
            items = self.report.items_emitted,
            abandoned = self.report.abandoned,
            reason,
            "Crawl completed"
        );
        Ok(self.report.clone())
    }

    /// Runs until the queue drains
    pub async fn run_to_completion(&mut self) -> Result<CrawlReport> {
        self.run(future::pending()).await
    }

    /// The loop proper; returns true when stopped by the shutdown signal
    async fn drive<F>(&mut self, shutdown: F) -> Result<bool>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut in_flight: JoinSet<Completion> = JoinSet::new();
        let mut ticker = self.count_interval.map(|period| {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut stopping = false;

        loop {
            let resume_at = if stopping {
                None
            } else {
                self.dispatch_ready(&mut in_flight)?
            };

            if in_flight.is_empty() && (stopping || self.queued() == 0) {
                break;
            }

            tokio::select! {
                _ = &mut shutdown, if !stopping => {
                    stopping = true;
                    info!(
                        in_flight = in_flight.len(),
                        queued = self.queued(),
                        "Shutdown requested, draining in-flight requests"
                    );
                }
                Some(joined) = in_flight.join_next() => match joined {
                    Ok(completion) => self.handle_completion(completion)?,
                    Err(e) => error!(error = %e, "Request task lost"),
                },
                _ = next_tick(&mut ticker) => {
                    info!(
                        requests = self.report.total_requests(),
                        items = self.report.items_emitted,
                        in_flight = in_flight.len(),
                        queued = self.queued(),
                        "Progress"
                    );
                    self.dispatcher.snapshot_counts(REASON_PERIODIC, Utc::now());
                }
                _ = wait_until(resume_at), if resume_at.is_some() => {}
                else => break,
            }
        }

        if stopping && self.queued() > 0 {
            warn!(dropped = self.queued(), "Unsent requests dropped at shutdown");
        }
        Ok(stopping)
    }

    /// Moves retries whose backoff has elapsed onto the queue
    ///
    /// Returns when the next held retry becomes due.
    fn release_delayed(&mut self, now: Instant) -> Option<Instant> {
        self.delayed.sort_by_key(|(due, _)| *due);
        let ready = self.delayed.partition_point(|(due, _)| *due <= now);
        self.queue
            .extend(self.delayed.drain(..ready).map(|(_, intent)| intent));
        self.delayed.first().map(|(due, _)| *due)
    }

    /// Issues queued intents until the in-flight limit is reached
    ///
    /// Returns the next time the loop has to wake up without a completion:
    /// a held retry coming due, or a credential coming out of cooldown.
    fn dispatch_ready(&mut self, in_flight: &mut JoinSet<Completion>) -> Result<Option<Instant>> {
        let next_due = self.release_delayed(Instant::now());
        let stalled = self.dispatch_queue(in_flight)?;
        Ok(match (next_due, stalled) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (due, stalled) => due.or(stalled),
        })
    }

    fn dispatch_queue(&mut self, in_flight: &mut JoinSet<Completion>) -> Result<Option<Instant>> {
        while in_flight.len() < self.max_in_flight {
            let Some(intent) = self.queue.pop_front() else {
                break;
            };

            match self.dispatcher.prepare(intent, Utc::now(), Instant::now()) {
                Preparation::Ready(prepared) => self.spawn_request(in_flight, prepared),
                Preparation::Declined(intent) => {
                    self.queue.push_front(intent);

                    if self.dispatcher.all_retired() {
                        error!(
                            queued = self.queue.len(),
                            "Every credential is retired, abandoning remaining work"
                        );
                        self.abandon_queue()?;
                        return Ok(None);
                    }

                    let now = Utc::now();
                    let wait = self
                        .dispatcher
                        .next_available_at()
                        .and_then(|at| (at - now).to_std().ok())
                        .unwrap_or(Duration::from_secs(1))
                        + Duration::from_millis(5);
                    debug!(
                        wait_ms = wait.as_millis() as u64,
                        queued = self.queue.len(),
                        "No credential available, holding requests"
                    );
                    return Ok(Some(Instant::now() + wait));
                }
            }
        }
        Ok(None)
    }

    fn spawn_request(&mut self, in_flight: &mut JoinSet<Completion>, prepared: PreparedRequest) {
        let PreparedRequest {
            intent,
            request,
            ticket,
        } = prepared;

        self.report.record_request(intent.kind);
        debug!(
            url = %intent.url,
            kind = intent.kind.as_str(),
            lane = %intent.context.lane.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Dispatching request"
        );

        let transport = Arc::clone(&self.transport);
        in_flight.spawn(async move {
            time::sleep_until(ticket.send_at).await;
            let result = match ticket.permits.acquire_owned().await {
                Ok(permit) => {
                    // A panic inside the transport comes back as a JoinError here
                    let exchange = tokio::spawn(async move { transport.execute(request).await });
                    let result = match exchange.await {
                        Ok(result) => result,
                        Err(e) => Err(TransportError::new(
                            TransportErrorKind::Aborted,
                            e.to_string(),
                        )),
                    };
                    drop(permit);
                    result
                }
                Err(_) => Err(TransportError::new(
                    TransportErrorKind::Other,
                    "lane closed",
                )),
            };
            Completion { intent, result }
        });
    }

    /// Turns a finished request into outcomes, mode steps and retries
    fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let Completion { intent, result } = completion;
        let now = Utc::now();
        let clock = Instant::now();

        match result {
            Ok(response) => match classify_status(response.status) {
                StatusClass::Success => {
                    self.dispatcher
                        .on_outcome(&intent.context, Outcome::Success, now, clock);

                    let tools = ModeTools { retry: &self.retry };
                    match self.mode.on_page(&intent, &response.body, &tools) {
                        Ok(step) => self.apply(step)?,
                        Err(e) => {
                            self.report.malformed += 1;
                            warn!(url = %intent.url, error = %e, "Malformed payload");
                            self.retry_or_abandon(intent, "malformed payload")?;
                        }
                    }
                }
                StatusClass::AuthRejected => {
                    self.report.auth_failures += 1;
                    warn!(
                        url = %intent.url,
                        status = response.status,
                        credential = intent.context.credential.as_deref().unwrap_or("anonymous"),
                        "Request rejected"
                    );
                    self.dispatcher
                        .on_outcome(&intent.context, Outcome::AuthFailure, now, clock);
                    self.retry_or_abandon(intent, "auth rejected")?;
                }
                StatusClass::Retryable => {
                    self.report.http_errors += 1;
                    debug!(url = %intent.url, status = response.status, "HTTP error");
                    let reason = format!("HTTP {}", response.status);
                    self.retry_or_abandon(intent, &reason)?;
                }
            },
            Err(e) if e.kind == TransportErrorKind::Aborted => {
                error!(
                    url = %intent.url,
                    error = %e.message,
                    "Request task aborted, abandoning request"
                );
                self.abandon(intent)?;
            }
            Err(e) => {
                self.report.network_failures += 1;
                warn!(
                    url = %intent.url,
                    kind = ?e.kind,
                    error = %e.message,
                    credential = intent.context.credential.as_deref().unwrap_or("anonymous"),
                    "Request failed"
                );
                self.dispatcher
                    .on_outcome(&intent.context, Outcome::NetworkFailure, now, clock);
                self.retry_or_abandon(intent, "network failure")?;
            }
        }
        Ok(())
    }

    /// Re-queues a failed intent under its own budget, or abandons it
    fn retry_or_abandon(&mut self, intent: FetchIntent, reason: &str) -> Result<()> {
        match self
            .retry
            .retry_intent(&intent, intent.context.budget, reason)
        {
            RetryDecision::Retry(again) => {
                self.report.retries += 1;
                if again.backoff.is_zero() {
                    self.queue.push_back(again);
                } else {
                    self.delayed.push((Instant::now() + again.backoff, again));
                }
                Ok(())
            }
            RetryDecision::Abandon => self.abandon(intent),
        }
    }

    fn abandon(&mut self, intent: FetchIntent) -> Result<()> {
        self.report.abandoned += 1;
        let tools = ModeTools { retry: &self.retry };
        let step = self.mode.on_abandon(&intent, &tools);
        self.apply(step)
    }

    /// Abandons every queued intent, including any the mode queues in response
    fn abandon_queue(&mut self) -> Result<()> {
        self.delayed.sort_by_key(|(due, _)| *due);
        self.queue
            .extend(self.delayed.drain(..).map(|(_, intent)| intent));
        while let Some(intent) = self.queue.pop_front() {
            warn!(url = %intent.url, "Abandoning request, no credential left");
            self.abandon(intent)?;
        }
        Ok(())
    }

    fn apply(&mut self, step: Step) -> Result<()> {
        self.queue.extend(step.intents);
        for item in step.items {
            self.sink.accept(item)?;
            self.report.items_emitted += 1;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("mode", &self.mode.name())
            .field("queued", &self.queued())
            .field("max_in_flight", &self.max_in_flight)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
