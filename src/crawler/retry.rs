//! Named retry budgets with exponential backoff

use crate::config::RetryConfig;
use crate::crawler::intent::{FetchIntent, RequestContext};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Name of an independent retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BudgetTag {
    /// Listing pages of a windowed search or thread
    Search,

    /// Detail lookups
    Api,

    /// Long-text fallback fetches
    LongText,

    /// Listing pages that came back without any result blocks
    EmptyPage,
}

impl BudgetTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Api => "api",
            Self::LongText => "longtext",
            Self::EmptyPage => "empty",
        }
    }
}

impl fmt::Display for BudgetTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-budget attempt counters carried by one request lineage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryCounters {
    counters: BTreeMap<BudgetTag, u32>,
}

impl RetryCounters {
    pub fn get(&self, tag: BudgetTag) -> u32 {
        self.counters.get(&tag).copied().unwrap_or(0)
    }

    pub fn set(&mut self, tag: BudgetTag, value: u32) {
        self.counters.insert(tag, value);
    }

    pub fn reset(&mut self, tag: BudgetTag) {
        self.counters.remove(&tag);
    }

    pub fn clear(&mut self) {
        self.counters.clear();
    }
}

/// Outcome of asking for another attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision<T> {
    /// Try again with this (incremented) value
    Retry(T),

    /// Budget exhausted; the caller picks the fallback
    Abandon,
}

impl<T> RetryDecision<T> {
    pub fn is_abandon(&self) -> bool {
        matches!(self, Self::Abandon)
    }
}

/// Decides retry versus abandon for every named budget
#[derive(Debug, Clone)]
pub struct RetryBudgetController {
    search: u32,
    api: u32,
    long_text: u32,
    empty_page: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryBudgetController {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            search: config.search,
            api: config.api,
            long_text: config.long_text,
            empty_page: config.empty_page,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Maximum attempts allowed under a budget
    pub fn ceiling(&self, tag: BudgetTag) -> u32 {
        match tag {
            BudgetTag::Search => self.search,
            BudgetTag::Api => self.api,
            BudgetTag::LongText => self.long_text,
            BudgetTag::EmptyPage => self.empty_page,
        }
    }

    /// Delay before the given retry attempt (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponential = self.base_delay_ms as f64 * 2f64.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };
        Duration::from_millis(delay_ms)
    }

    /// Grants a retry under `tag`, or abandons once the counter hits the ceiling
    pub fn should_retry(
        &self,
        context: &RequestContext,
        tag: BudgetTag,
        reason: &str,
        url: &str,
    ) -> RetryDecision<RequestContext> {
        let attempt = context.retries.get(tag);
        let ceiling = self.ceiling(tag);

        if attempt >= ceiling {
            warn!(
                budget = %tag,
                attempt,
                ceiling,
                reason,
                url,
                "Retry budget exhausted, abandoning request"
            );
            return RetryDecision::Abandon;
        }

        let mut next = context.clone();
        next.retries.set(tag, attempt + 1);
        debug!(budget = %tag, attempt = attempt + 1, ceiling, reason, url, "Retrying request");
        RetryDecision::Retry(next)
    }

    /// Clones the intent with an incremented counter and its backoff delay
    pub fn retry_intent(
        &self,
        intent: &FetchIntent,
        tag: BudgetTag,
        reason: &str,
    ) -> RetryDecision<FetchIntent> {
        match self.should_retry(&intent.context, tag, reason, &intent.url) {
            RetryDecision::Retry(context) => {
                let attempt = context.retries.get(tag);
                let mut retried = intent.clone();
                retried.context = context;
                retried.backoff = self.backoff(attempt);
                RetryDecision::Retry(retried)
            }
            RetryDecision::Abandon => RetryDecision::Abandon,
        }
    }
}

impl Default for RetryBudgetController {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
