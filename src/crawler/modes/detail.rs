//! Direct lookups of known item ids

use super::{required_template, CrawlMode, ItemFollowUp, ModeTools, Step};
use crate::config::ModeEntry;
use crate::crawler::intent::{FetchIntent, IntentKind};
use crate::crawler::parser::{ClassifyError, PayloadClassifier};
use crate::HarvestError;
use std::sync::Arc;
use tracing::warn;

/// Fetches one detail record per seed id, expanding long text when truncated
#[derive(Debug)]
pub struct DetailLookup {
    name: String,
    detail_url: String,
    follow_up: ItemFollowUp,
}

impl DetailLookup {
    pub fn new(entry: &ModeEntry, classifier: Arc<dyn PayloadClassifier>) -> Result<Self, HarvestError> {
        Ok(Self {
            name: entry.name.clone(),
            detail_url: required_template(entry, "detail-url", &entry.detail_url)?,
            follow_up: ItemFollowUp::new(entry, classifier),
        })
    }
}

impl CrawlMode for DetailLookup {
    fn name(&self) -> &str {
        &self.name
    }

    fn seed(&mut self, ids: &[String]) -> Vec<FetchIntent> {
        ids.iter()
            .filter_map(|id| self.follow_up.detail_intent(&self.detail_url, id, id, None))
            .collect()
    }

    fn on_page(
        &mut self,
        intent: &FetchIntent,
        body: &[u8],
        _tools: &ModeTools<'_>,
    ) -> Result<Step, ClassifyError> {
        match intent.kind {
            IntentKind::Detail => self.follow_up.on_detail(intent, body),
            IntentKind::LongText => self.follow_up.on_long_text(intent, body),
            IntentKind::Listing | IntentKind::Replies => Ok(Step::default()),
        }
    }

    fn on_abandon(&mut self, intent: &FetchIntent, _tools: &ModeTools<'_>) -> Step {
        match intent.kind {
            IntentKind::LongText => self.follow_up.on_long_text_abandoned(intent),
            _ => {
                warn!(id = intent.seed(), url = %intent.url, "Item could not be fetched");
                Step::default()
            }
        }
    }
}
