//! Fetch intents and the typed context they carry
//!
//! An intent holds everything needed to resume work when its response
//! arrives; handlers never rely on state captured elsewhere.

use crate::crawler::pagination::TargetKey;
use crate::crawler::retry::{BudgetTag, RetryCounters};
use crate::crawler::window::TimeWindow;
use crate::session::LaneKey;
use serde_json::Value;
use std::time::Duration;

/// What an intent fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    Listing,
    Detail,
    LongText,
    Replies,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listing => "listing",
            Self::Detail => "detail",
            Self::LongText => "longtext",
            Self::Replies => "replies",
        }
    }
}

/// The window an item was listed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRef {
    pub key: String,
    pub index: usize,
}

/// The unit of work an intent belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// A listing page of one search window
    Window {
        key: String,
        window: TimeWindow,
        page: u32,
    },

    /// A cursor-paginated thread (top level or nested replies) under a root seed
    Thread {
        root: String,
        target: TargetKey,
        cursor: Option<String>,
    },

    /// A page-numbered list
    Flat { target: String, page: u32 },

    /// One item (detail or long text)
    Item {
        seed: String,
        item_id: String,
        origin: Option<WindowRef>,
    },
}

impl Scope {
    /// The externally supplied id this work descends from
    pub fn seed(&self) -> &str {
        match self {
            Self::Window { key, .. } => key,
            Self::Thread { root, .. } => root,
            Self::Flat { target, .. } => target,
            Self::Item { seed, .. } => seed,
        }
    }
}

/// Request context fixed by the engine, filled in as the request moves along
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Budget charged when this request fails
    pub budget: BudgetTag,

    pub retries: RetryCounters,

    pub scope: Scope,

    /// Set by the dispatcher; `None` for unauthenticated requests
    pub credential: Option<String>,

    /// The credential's epoch when the request was dispatched
    pub credential_epoch: Option<u64>,

    pub proxy: Option<String>,

    pub lane: Option<LaneKey>,
}

impl RequestContext {
    pub fn new(budget: BudgetTag, scope: Scope) -> Self {
        Self {
            budget,
            retries: RetryCounters::default(),
            scope,
            credential: None,
            credential_epoch: None,
            proxy: None,
            lane: None,
        }
    }
}

/// A request the engine should make
#[derive(Debug, Clone, PartialEq)]
pub struct FetchIntent {
    pub url: String,
    pub kind: IntentKind,
    pub context: RequestContext,

    /// Extra headers; these override the engine defaults
    pub headers: Vec<(String, String)>,

    /// How long the engine holds the intent back before dispatching it; set on retries
    pub backoff: Duration,

    /// Partial record completed by this fetch (long-text fallback)
    pub carried: Option<Value>,
}

impl FetchIntent {
    pub fn new(url: impl Into<String>, kind: IntentKind, budget: BudgetTag, scope: Scope) -> Self {
        Self {
            url: url.into(),
            kind,
            context: RequestContext::new(budget, scope),
            headers: Vec::new(),
            backoff: Duration::ZERO,
            carried: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_carried(mut self, record: Value) -> Self {
        self.carried = Some(record);
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.context.scope
    }

    pub fn seed(&self) -> &str {
        self.context.scope.seed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_intent_has_clean_context() {
        let intent = FetchIntent::new(
            "https://api.example.com/show?id=9",
            IntentKind::Detail,
            BudgetTag::Api,
            Scope::Item {
                seed: "rust".to_string(),
                item_id: "9".to_string(),
                origin: None,
            },
        )
        .with_header("Accept", "application/json");

        assert_eq!(intent.seed(), "rust");
        assert_eq!(intent.context.budget, BudgetTag::Api);
        assert_eq!(intent.context.retries.get(BudgetTag::Api), 0);
        assert!(intent.context.credential.is_none());
        assert!(intent.context.lane.is_none());
        assert_eq!(intent.backoff, Duration::ZERO);
        assert_eq!(intent.headers.len(), 1);
    }

    #[test]
    fn test_scope_seed() {
        let thread = Scope::Thread {
            root: "post-1".to_string(),
            target: TargetKey::replies("c-7"),
            cursor: Some("0".to_string()),
        };
        assert_eq!(thread.seed(), "post-1");
        assert_eq!(
            Scope::Flat {
                target: "u1".to_string(),
                page: 3
            }
            .seed(),
            "u1"
        );
    }
}
