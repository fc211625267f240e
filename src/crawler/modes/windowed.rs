//! Keyword search over sequential time windows

use super::{render_url, required_template, CrawlMode, ItemFollowUp, ModeTools, Step};
use crate::config::ModeEntry;
use crate::crawler::intent::{FetchIntent, IntentKind, Scope, WindowRef};
use crate::crawler::pagination::{PaginationDedupTracker, TargetKey};
use crate::crawler::parser::{ClassifyError, PayloadClassifier};
use crate::crawler::retry::{BudgetTag, RetryDecision};
use crate::crawler::window::{Advance, TimeWindow, TimeWindowScheduler, WindowSummary};
use crate::HarvestError;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Searches each key window by window, paginating every window to exhaustion
///
/// Listed items are deduplicated per window and followed up with a detail
/// fetch. The next page is dispatched as soon as a page is seen, so detail
/// fetches never hold up pagination.
#[derive(Debug)]
pub struct WindowedSearch {
    name: String,
    listing_url: String,
    label_format: String,
    scheduler: TimeWindowScheduler,
    dedup: PaginationDedupTracker,
    classifier: Arc<dyn PayloadClassifier>,
    follow_up: ItemFollowUp,
}

impl WindowedSearch {
    pub fn new(entry: &ModeEntry, classifier: Arc<dyn PayloadClassifier>) -> Result<Self, HarvestError> {
        let window = entry.window.as_ref().ok_or_else(|| {
            HarvestError::Template(format!("mode '{}' has no window", entry.name))
        })?;

        Ok(Self {
            name: entry.name.clone(),
            listing_url: required_template(entry, "listing-url", &entry.listing_url)?,
            label_format: window.label_format.clone(),
            scheduler: TimeWindowScheduler::new(
                window.start,
                window.end,
                Duration::minutes(window.step_minutes as i64),
            ),
            dedup: PaginationDedupTracker::new(),
            follow_up: ItemFollowUp::new(entry, Arc::clone(&classifier)),
            classifier,
        })
    }

    pub fn scheduler(&self) -> &TimeWindowScheduler {
        &self.scheduler
    }

    fn listing_intent(&self, key: &str, window: &TimeWindow, page: u32) -> Option<FetchIntent> {
        let (start, end) = window.labels(&self.label_format);
        let page_number = page.to_string();
        let url = render_url(
            &self.listing_url,
            &[
                ("key", key),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("page", page_number.as_str()),
            ],
        )?;

        Some(FetchIntent::new(
            url,
            IntentKind::Listing,
            BudgetTag::Search,
            Scope::Window {
                key: key.to_string(),
                window: window.clone(),
                page,
            },
        ))
    }

    /// The next listing page, with fresh retry counters
    ///
    /// A URL-like affordance is followed as given; anything else means
    /// "there is a next page" and the page number is incremented.
    fn next_page_intent(
        &self,
        current: &FetchIntent,
        key: &str,
        window: &TimeWindow,
        page: u32,
        affordance: &str,
    ) -> Option<FetchIntent> {
        let mut next = self.listing_intent(key, window, page + 1)?;
        if affordance.starts_with("http") || affordance.starts_with('/') || affordance.starts_with('?') {
            if let Ok(url) = Url::parse(&current.url).and_then(|base| base.join(affordance)) {
                next.url = url.to_string();
            }
        }
        next.headers = current.headers.clone();
        Some(next)
    }

    /// Closes a window and dispatches the first page of the next one
    fn finish(&mut self, key: &str, index: usize, reason: &str) -> Step {
        self.dedup.release(&window_target(key, index));

        match self.scheduler.finish_window(key, index, reason) {
            Some(Advance::Next(window)) => self
                .listing_intent(key, &window, 1)
                .map(Step::intent)
                .unwrap_or_default(),
            Some(Advance::Drained) | None => Step::default(),
        }
    }

    fn on_listing(
        &mut self,
        intent: &FetchIntent,
        body: &[u8],
        tools: &ModeTools<'_>,
    ) -> Result<Step, ClassifyError> {
        let Scope::Window { key, window, page } = intent.scope() else {
            return Ok(Step::default());
        };
        if !self.scheduler.is_current(key, window.index) {
            debug!(key = %key, window = %window, "Ignoring page of a finished window");
            return Ok(Step::default());
        }

        let listing = self.classifier.classify_listing(body)?;

        if listing.no_results {
            info!(key = %key, window = %window, page, "No search results");
            return Ok(self.finish(key, window.index, "no-results"));
        }

        if listing.is_empty_page() {
            return Ok(match tools.retry.retry_intent(intent, BudgetTag::EmptyPage, "empty page") {
                RetryDecision::Retry(mut again) => {
                    again.context.retries.reset(BudgetTag::Search);
                    Step::intent(again)
                }
                RetryDecision::Abandon => {
                    info!(key = %key, window = %window, page, "Empty page limit reached, moving to next window");
                    self.finish(key, window.index, "empty-page-limit")
                }
            });
        }

        self.scheduler.mark_paginating(key, window.index);
        let target = window_target(key, window.index);
        let observation = self.dedup.observe_page(&target, listing.item_ids());
        self.scheduler
            .record_items(key, window.index, observation.new_item_ids.len());

        let mut step = match (&listing.next_page, observation.should_continue) {
            (Some(affordance), true) => self
                .next_page_intent(intent, key, window, *page, affordance)
                .map(Step::intent)
                .unwrap_or_default(),
            (Some(_), false) => self.finish(key, window.index, "no-new-items"),
            (None, _) => self.finish(key, window.index, "no-next-page"),
        };

        let origin = WindowRef {
            key: key.clone(),
            index: window.index,
        };
        for item in listing
            .items
            .iter()
            .filter(|item| observation.new_item_ids.contains(&item.id))
        {
            step.extend(self.follow_up.follow(key, item, Some(origin.clone())));
        }

        Ok(step)
    }
}

/// Dedup target for one window of one key
fn window_target(key: &str, index: usize) -> TargetKey {
    TargetKey::top_level(format!("{}#{}", key, index))
}

impl CrawlMode for WindowedSearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn seed(&mut self, ids: &[String]) -> Vec<FetchIntent> {
        let mut intents = Vec::new();
        for key in ids {
            match self.scheduler.start_key(key) {
                Some(window) => {
                    info!(
                        key = %key,
                        windows = self.scheduler.windows().len(),
                        "Starting windowed search"
                    );
                    intents.extend(self.listing_intent(key, &window, 1));
                }
                None => debug!(key = %key, "Search key skipped (already seen or empty range)"),
            }
        }
        intents
    }

    fn on_page(
        &mut self,
        intent: &FetchIntent,
        body: &[u8],
        tools: &ModeTools<'_>,
    ) -> Result<Step, ClassifyError> {
        match intent.kind {
            IntentKind::Listing => self.on_listing(intent, body, tools),
            IntentKind::Detail => self.follow_up.on_detail(intent, body),
            IntentKind::LongText => self.follow_up.on_long_text(intent, body),
            IntentKind::Replies => Ok(Step::default()),
        }
    }

    fn on_abandon(&mut self, intent: &FetchIntent, _tools: &ModeTools<'_>) -> Step {
        match (intent.kind, intent.scope()) {
            (IntentKind::Listing, Scope::Window { key, window, .. }) => {
                self.finish(key, window.index, "abandoned")
            }
            (IntentKind::LongText, _) => self.follow_up.on_long_text_abandoned(intent),
            _ => Step::default(),
        }
    }

    fn window_summaries(&self) -> Vec<WindowSummary> {
        self.scheduler.completed().to_vec()
    }
}
