//! Cursor-paginated threads with one level of nested replies

use super::{render_url, required_template, CrawlMode, ModeTools, Step};
use crate::config::ModeEntry;
use crate::crawler::intent::{FetchIntent, IntentKind, Scope};
use crate::crawler::pagination::{PaginationDedupTracker, SubLevel, TargetKey};
use crate::crawler::parser::{ClassifyError, PayloadClassifier};
use crate::crawler::retry::BudgetTag;
use crate::output::HarvestedItem;
use crate::HarvestError;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Walks the thread under each seed, following the server's cursor
///
/// Top-level entries flagged as having more replies get their own reply
/// thread, paginated the same way. Every entry is emitted as-is, tagged with
/// the root seed.
#[derive(Debug)]
pub struct ThreadedListing {
    name: String,
    listing_url: String,
    replies_url: Option<String>,
    cursor_param: String,
    dedup: PaginationDedupTracker,
    classifier: Arc<dyn PayloadClassifier>,
}

impl ThreadedListing {
    pub fn new(entry: &ModeEntry, classifier: Arc<dyn PayloadClassifier>) -> Result<Self, HarvestError> {
        Ok(Self {
            name: entry.name.clone(),
            listing_url: required_template(entry, "listing-url", &entry.listing_url)?,
            replies_url: entry.replies_url.clone(),
            cursor_param: entry.cursor_param.clone(),
            dedup: PaginationDedupTracker::new(),
            classifier,
        })
    }

    /// Threads still being paginated
    pub fn open_threads(&self) -> usize {
        self.dedup.len()
    }

    fn thread_intent(&self, root: &str, target: TargetKey, cursor: Option<String>) -> Option<FetchIntent> {
        let (url_template, kind) = match target.level {
            SubLevel::TopLevel => (self.listing_url.as_str(), IntentKind::Listing),
            SubLevel::Replies => (self.replies_url.as_deref()?, IntentKind::Replies),
        };

        let mut url = render_url(url_template, &[("id", target.id.as_str()), ("key", root)])?;
        if let Some(cursor) = &cursor {
            url = with_cursor(&url, &self.cursor_param, cursor)?;
        }

        Some(FetchIntent::new(
            url,
            kind,
            BudgetTag::Search,
            Scope::Thread {
                root: root.to_string(),
                target,
                cursor,
            },
        ))
    }
}

/// Appends the cursor parameter to a rendered listing URL
fn with_cursor(url: &str, param: &str, cursor: &str) -> Option<String> {
    let mut url = Url::parse(url).ok()?;
    url.query_pairs_mut().append_pair(param, cursor);
    Some(url.to_string())
}

impl CrawlMode for ThreadedListing {
    fn name(&self) -> &str {
        &self.name
    }

    fn seed(&mut self, ids: &[String]) -> Vec<FetchIntent> {
        ids.iter()
            .filter_map(|root| {
                info!(root = %root, "Starting thread");
                self.thread_intent(root, TargetKey::top_level(root.as_str()), None)
            })
            .collect()
    }

    fn on_page(
        &mut self,
        intent: &FetchIntent,
        body: &[u8],
        _tools: &ModeTools<'_>,
    ) -> Result<Step, ClassifyError> {
        let Scope::Thread { root, target, .. } = intent.scope() else {
            return Ok(Step::default());
        };

        let listing = self.classifier.classify_listing(body)?;
        let observation = self.dedup.observe_page(target, listing.item_ids());

        let mut step = Step::default();
        for item in listing
            .items
            .iter()
            .filter(|item| observation.new_item_ids.contains(&item.id))
        {
            step.items.push(HarvestedItem::new(root.as_str(), item.raw.clone()));

            if target.level == SubLevel::TopLevel && item.nested {
                step.intents
                    .extend(self.thread_intent(root, TargetKey::replies(item.id.as_str()), None));
            }
        }

        let next = match &listing.next_page {
            Some(cursor) if observation.should_continue && self.dedup.advance_cursor(target, cursor) => {
                self.thread_intent(root, target.clone(), Some(cursor.clone()))
            }
            _ => None,
        };

        match next {
            Some(mut next) => {
                next.headers = intent.headers.clone();
                step.intents.push(next);
            }
            None => {
                debug!(
                    root = %root,
                    thread = %target,
                    seen = self.dedup.seen_count(target),
                    "Thread finished"
                );
                self.dedup.release(target);
            }
        }

        Ok(step)
    }

    fn on_abandon(&mut self, intent: &FetchIntent, _tools: &ModeTools<'_>) -> Step {
        if let Scope::Thread { target, .. } = intent.scope() {
            self.dedup.release(target);
        }
        Step::default()
    }
}
