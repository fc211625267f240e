//! Crawl modes
//!
//! A mode turns seeds into fetch intents and each response into further
//! intents and harvested items. Modes never touch the network, credentials,
//! or retry timing directly; they only decide what to fetch next.

mod detail;
mod flat;
mod threaded;
mod windowed;

pub use detail::DetailLookup;
pub use flat::FlatListing;
pub use threaded::ThreadedListing;
pub use windowed::WindowedSearch;

use crate::config::{Config, ModeEntry, ModeKind};
use crate::crawler::intent::{FetchIntent, IntentKind, Scope, WindowRef};
use crate::crawler::parser::{ClassifyError, JsonPointerClassifier, ListedItem, PayloadClassifier};
use crate::crawler::retry::{BudgetTag, RetryBudgetController};
use crate::crawler::template;
use crate::crawler::window::WindowSummary;
use crate::output::HarvestedItem;
use crate::HarvestError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Record field that receives the expanded long text
pub const LONG_TEXT_FIELD: &str = "long_text";

/// Set on records whose long text was fetched
pub const LONG_TEXT_EXPANDED_FIELD: &str = "long_text_expanded";

/// What a handler produced for one response
#[derive(Debug, Default)]
pub struct Step {
    pub intents: Vec<FetchIntent>,
    pub items: Vec<HarvestedItem>,
}

impl Step {
    pub fn intent(intent: FetchIntent) -> Self {
        Self {
            intents: vec![intent],
            items: Vec::new(),
        }
    }

    pub fn item(item: HarvestedItem) -> Self {
        Self {
            intents: Vec::new(),
            items: vec![item],
        }
    }

    pub fn extend(&mut self, other: Step) {
        self.intents.extend(other.intents);
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty() && self.items.is_empty()
    }
}

/// Engine services a mode may use while handling a response
#[derive(Debug, Clone, Copy)]
pub struct ModeTools<'a> {
    pub retry: &'a RetryBudgetController,
}

/// Produces next fetch intents from prior results
pub trait CrawlMode: Send {
    fn name(&self) -> &str;

    /// Initial intents for the given seed ids
    fn seed(&mut self, ids: &[String]) -> Vec<FetchIntent>;

    /// Handles a successful (2xx) response
    ///
    /// A `ClassifyError` is treated as a retryable failure of the intent.
    fn on_page(
        &mut self,
        intent: &FetchIntent,
        body: &[u8],
        tools: &ModeTools<'_>,
    ) -> Result<Step, ClassifyError>;

    /// Called once an intent's retry budget is exhausted
    fn on_abandon(&mut self, intent: &FetchIntent, tools: &ModeTools<'_>) -> Step;

    /// Finished windows, for modes that partition by time
    fn window_summaries(&self) -> Vec<WindowSummary> {
        Vec::new()
    }
}

/// Builds a mode from its configuration entry
pub type ModeFactory =
    Arc<dyn Fn(&ModeEntry) -> Result<Box<dyn CrawlMode>, HarvestError> + Send + Sync>;

/// Mode name to handler mapping
///
/// Populated from `[[mode]]` configuration entries; each entry is built by
/// the handler for its `kind` unless a factory was registered for its name.
#[derive(Clone, Default)]
pub struct ModeRegistry {
    entries: BTreeMap<String, ModeEntry>,
    factories: BTreeMap<String, ModeFactory>,
}

impl ModeRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::default();
        for entry in &config.modes {
            registry.add_entry(entry.clone());
        }
        registry
    }

    pub fn add_entry(&mut self, entry: ModeEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    /// Overrides the handler for one mode name
    pub fn register(&mut self, name: impl Into<String>, factory: ModeFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entry(&self, name: &str) -> Option<&ModeEntry> {
        self.entries.get(name)
    }

    pub fn build(&self, name: &str) -> Result<Box<dyn CrawlMode>, HarvestError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| HarvestError::UnknownMode(name.to_string()))?;

        if let Some(factory) = self.factories.get(name) {
            return factory(entry);
        }

        let classifier: Arc<dyn PayloadClassifier> =
            Arc::new(JsonPointerClassifier::new(entry.payload.clone()));

        let mode: Box<dyn CrawlMode> = match entry.kind {
            ModeKind::WindowedSearch => Box::new(WindowedSearch::new(entry, classifier)?),
            ModeKind::Threaded => Box::new(ThreadedListing::new(entry, classifier)?),
            ModeKind::FlatList => Box::new(FlatListing::new(entry, classifier)?),
            ModeKind::Detail => Box::new(DetailLookup::new(entry, classifier)?),
        };
        Ok(mode)
    }
}

impl std::fmt::Debug for ModeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeRegistry")
            .field("modes", &self.entries.keys().collect::<Vec<_>>())
            .field("overrides", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Renders a URL template, logging instead of failing
///
/// Templates are checked when the configuration loads, so a failure here is a
/// value problem for one request; that request is skipped.
pub(crate) fn render_url(url_template: &str, values: &[(&str, &str)]) -> Option<String> {
    match template::render(url_template, values) {
        Ok(url) => Some(url),
        Err(e) => {
            error!(template = url_template, error = %e, "Could not build request URL");
            None
        }
    }
}

pub(crate) fn required_template(
    entry: &ModeEntry,
    field: &str,
    value: &Option<String>,
) -> Result<String, HarvestError> {
    value.clone().ok_or_else(|| {
        HarvestError::Template(format!("mode '{}' has no {}", entry.name, field))
    })
}

/// Detail and long-text follow-up for listed items, shared by all modes
#[derive(Debug, Clone)]
pub(crate) struct ItemFollowUp {
    detail_url: Option<String>,
    long_text_url: Option<String>,
    classifier: Arc<dyn PayloadClassifier>,
}

impl ItemFollowUp {
    pub(crate) fn new(entry: &ModeEntry, classifier: Arc<dyn PayloadClassifier>) -> Self {
        Self {
            detail_url: entry.detail_url.clone(),
            long_text_url: entry.long_text_url.clone(),
            classifier,
        }
    }

    /// A detail fetch for the item, or the listed entry itself without a detail URL
    pub(crate) fn follow(
        &self,
        seed: &str,
        item: &ListedItem,
        origin: Option<WindowRef>,
    ) -> Step {
        match &self.detail_url {
            Some(detail_url) => self
                .detail_intent(detail_url, seed, &item.id, origin)
                .map(Step::intent)
                .unwrap_or_default(),
            None => Step::item(HarvestedItem::new(seed, item.raw.clone())),
        }
    }

    pub(crate) fn detail_intent(
        &self,
        detail_url: &str,
        seed: &str,
        item_id: &str,
        origin: Option<WindowRef>,
    ) -> Option<FetchIntent> {
        let url = render_url(detail_url, &[("id", item_id), ("key", seed)])?;
        Some(FetchIntent::new(
            url,
            IntentKind::Detail,
            BudgetTag::Api,
            Scope::Item {
                seed: seed.to_string(),
                item_id: item_id.to_string(),
                origin,
            },
        ))
    }

    /// Handles a detail response: emit the record or fetch its long text
    pub(crate) fn on_detail(&self, intent: &FetchIntent, body: &[u8]) -> Result<Step, ClassifyError> {
        let detail = self.classifier.classify_detail(body)?;
        let seed = intent.seed().to_string();

        if detail.long_text_pending {
            if let (Some(long_text_url), Scope::Item { item_id, .. }) =
                (&self.long_text_url, intent.scope())
            {
                if let Some(url) = render_url(long_text_url, &[("id", item_id.as_str()), ("key", seed.as_str())]) {
                    let mut follow = FetchIntent::new(
                        url,
                        IntentKind::LongText,
                        BudgetTag::LongText,
                        intent.context.scope.clone(),
                    )
                    .with_carried(detail.record);
                    follow.headers = intent.headers.clone();
                    return Ok(Step::intent(follow));
                }
            }
        }

        Ok(Step::item(HarvestedItem::new(seed, detail.record)))
    }

    /// Merges fetched long text into the carried record
    pub(crate) fn on_long_text(
        &self,
        intent: &FetchIntent,
        body: &[u8],
    ) -> Result<Step, ClassifyError> {
        let text = self.classifier.extract_long_text(body)?;
        let mut record = intent.carried.clone().unwrap_or(Value::Null);

        if let (Some(text), Value::Object(fields)) = (text, &mut record) {
            fields.insert(LONG_TEXT_FIELD.to_string(), Value::String(text));
            fields.insert(LONG_TEXT_EXPANDED_FIELD.to_string(), Value::Bool(true));
        }

        Ok(Step::item(HarvestedItem::new(intent.seed(), record)))
    }

    /// The partial record of an abandoned long-text fetch
    pub(crate) fn on_long_text_abandoned(&self, intent: &FetchIntent) -> Step {
        match &intent.carried {
            Some(record) => Step::item(HarvestedItem::new(intent.seed(), record.clone())),
            None => Step::default(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::{ModeEntry, ModeKind, PayloadConfig, WindowConfig};
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    pub fn payload() -> PayloadConfig {
        PayloadConfig {
            items: "/data/list".to_string(),
            item_id: "/id".to_string(),
            no_results: Some("/data/noResult".to_string()),
            next_page: Some("/data/next".to_string()),
            nested: Some("/more_info".to_string()),
            record: Some("/data".to_string()),
            long_text_flag: Some("/isLongText".to_string()),
            long_text_content: "/data/longTextContent".to_string(),
        }
    }

    pub fn entry(kind: ModeKind) -> ModeEntry {
        ModeEntry {
            name: "test".to_string(),
            kind,
            listing_url: Some(match kind {
                ModeKind::WindowedSearch => {
                    "https://api.example.com/search?q={key}&start={start}&end={end}&page={page}"
                        .to_string()
                }
                ModeKind::Threaded => "https://api.example.com/comments?id={id}&count=20".to_string(),
                _ => "https://api.example.com/list?uid={id}&page={page}".to_string(),
            }),
            detail_url: Some("https://api.example.com/show?id={id}".to_string()),
            long_text_url: Some("https://api.example.com/longtext?id={id}".to_string()),
            replies_url: Some("https://api.example.com/replies?id={id}&count=20".to_string()),
            cursor_param: "max_id".to_string(),
            seeds: vec![],
            window: Some(WindowConfig {
                start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap(),
                step_minutes: 60,
                label_format: "%Y-%m-%d-%H".to_string(),
            }),
            payload: payload(),
        }
    }

    pub fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }
}
