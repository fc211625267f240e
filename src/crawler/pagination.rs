//! Seen-item and cursor bookkeeping for paginated listings
//!
//! Pagination of a target stops as soon as a page brings nothing new, or the
//! server hands back the cursor it was just given.

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Which listing of a target is being paginated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubLevel {
    TopLevel,
    Replies,
}

impl SubLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopLevel => "top-level",
            Self::Replies => "replies",
        }
    }
}

/// A logical pagination target: resource id plus sub-level
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub id: String,
    pub level: SubLevel,
}

impl TargetKey {
    pub fn new(id: impl Into<String>, level: SubLevel) -> Self {
        Self {
            id: id.into(),
            level,
        }
    }

    pub fn top_level(id: impl Into<String>) -> Self {
        Self::new(id, SubLevel::TopLevel)
    }

    pub fn replies(id: impl Into<String>) -> Self {
        Self::new(id, SubLevel::Replies)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.level.as_str())
    }
}

/// Progress of one target
#[derive(Debug, Clone, Default)]
pub struct PaginationCursor {
    pub seen: HashSet<String>,
    pub last_cursor: Option<String>,

    /// The last observed page added nothing
    pub stalled: bool,
}

/// Result of observing one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageObservation {
    /// Ids not seen before, in page order
    pub new_item_ids: Vec<String>,

    /// False when the page added nothing; no next page may be requested
    pub should_continue: bool,
}

/// Dedup state for every target being paginated
#[derive(Debug, Clone, Default)]
pub struct PaginationDedupTracker {
    cursors: HashMap<TargetKey, PaginationCursor>,
}

impl PaginationDedupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a page of item ids and reports which are new
    pub fn observe_page<I, S>(&mut self, target: &TargetKey, item_ids: I) -> PageObservation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cursor = self.cursors.entry(target.clone()).or_default();

        let mut new_item_ids = Vec::new();
        for id in item_ids {
            let id = id.into();
            if cursor.seen.insert(id.clone()) {
                new_item_ids.push(id);
            }
        }

        cursor.stalled = new_item_ids.is_empty();
        PageObservation {
            should_continue: !cursor.stalled,
            new_item_ids,
        }
    }

    /// Records the cursor for the next page request
    ///
    /// Returns false, and the caller must stop, when the cursor equals the
    /// one used for the previous request.
    pub fn advance_cursor(&mut self, target: &TargetKey, next: &str) -> bool {
        let cursor = self.cursors.entry(target.clone()).or_default();
        if cursor.last_cursor.as_deref() == Some(next) {
            tracing::debug!(thread = %target, cursor = next, "Cursor did not advance");
            cursor.stalled = true;
            return false;
        }
        cursor.last_cursor = Some(next.to_string());
        true
    }

    /// Drops a finished target
    pub fn release(&mut self, target: &TargetKey) {
        self.cursors.remove(target);
    }

    pub fn seen_count(&self, target: &TargetKey) -> usize {
        self.cursors.get(target).map_or(0, |cursor| cursor.seen.len())
    }

    pub fn cursor(&self, target: &TargetKey) -> Option<&PaginationCursor> {
        self.cursors.get(target)
    }

    /// Targets still being tracked
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
