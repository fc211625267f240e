//! Time-window partitioning for keyword searches
//!
//! A search range is split into fixed-size windows which are crawled one at a
//! time, in chronological order, per search key. Different keys advance
//! independently.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::info;

/// A half-open interval `[start, end)` with its position in the key's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    pub index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Formats the window bounds for a listing URL
    pub fn labels(&self, format: &str) -> (String, String) {
        (
            self.start.format(format).to_string(),
            self.end.format(format).to_string(),
        )
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{} .. {})",
            self.index,
            self.start.format("%Y-%m-%dT%H:%M"),
            self.end.format("%Y-%m-%dT%H:%M")
        )
    }
}

/// Splits `[start, end)` into consecutive windows of `step`
///
/// The last window is clipped to `end`. An empty or inverted range, or a
/// non-positive step, yields no windows.
pub fn split_windows(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Vec<TimeWindow> {
    let mut windows = Vec::new();
    if step <= Duration::zero() {
        return windows;
    }

    let mut cursor = start;
    while cursor < end {
        let next = (cursor + step).min(end);
        windows.push(TimeWindow {
            index: windows.len(),
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    windows
}

/// Where the current window of a key stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    AwaitingFirstPage,
    Paginating,
    Exhausted,
}

/// What follows a finished window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Dispatch the first page of this window
    Next(TimeWindow),

    /// The key has no windows left
    Drained,
}

/// Per-window result kept for the crawl report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSummary {
    pub key: String,
    pub window: TimeWindow,
    pub items: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct KeyProgress {
    pending: VecDeque<TimeWindow>,
    current: TimeWindow,
    phase: WindowPhase,
    items: usize,
}

/// Ordered window queues for every search key
#[derive(Debug, Clone)]
pub struct TimeWindowScheduler {
    windows: Vec<TimeWindow>,
    keys: HashMap<String, KeyProgress>,
    completed: Vec<WindowSummary>,
    drained: Vec<String>,
}

impl TimeWindowScheduler {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Self {
        Self {
            windows: split_windows(start, end, step),
            keys: HashMap::new(),
            completed: Vec::new(),
            drained: Vec::new(),
        }
    }

    /// The windows every key walks through
    pub fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    /// Starts a key and returns its first window
    ///
    /// Returns `None` if the key is already tracked, was already drained,
    /// or there are no windows.
    pub fn start_key(&mut self, key: &str) -> Option<TimeWindow> {
        if self.keys.contains_key(key) || self.drained.iter().any(|done| done == key) {
            return None;
        }

        let mut pending: VecDeque<TimeWindow> = self.windows.iter().cloned().collect();
        let current = pending.pop_front()?;
        self.keys.insert(
            key.to_string(),
            KeyProgress {
                pending,
                current: current.clone(),
                phase: WindowPhase::AwaitingFirstPage,
                items: 0,
            },
        );
        Some(current)
    }

    /// Returns true if `index` is the key's window in progress
    pub fn is_current(&self, key: &str, index: usize) -> bool {
        self.keys
            .get(key)
            .map_or(false, |progress| progress.current.index == index)
    }

    pub fn phase(&self, key: &str) -> Option<WindowPhase> {
        self.keys.get(key).map(|progress| progress.phase)
    }

    /// Notes that a page of the current window came back with results
    pub fn mark_paginating(&mut self, key: &str, index: usize) {
        if let Some(progress) = self.current_mut(key, index) {
            progress.phase = WindowPhase::Paginating;
        }
    }

    /// Adds newly observed items to the current window's count
    pub fn record_items(&mut self, key: &str, index: usize, count: usize) {
        if let Some(progress) = self.current_mut(key, index) {
            progress.items += count;
        }
    }

    /// Closes the current window and advances to the next one
    ///
    /// Returns `None` when `index` is not the current window, so a late
    /// completion can never skip a window.
    pub fn finish_window(&mut self, key: &str, index: usize, reason: &str) -> Option<Advance> {
        let progress = self.current_mut(key, index)?;
        progress.phase = WindowPhase::Exhausted;

        let finished = progress.current.clone();
        let items = progress.items;
        info!(
            key,
            window = %finished,
            items,
            reason,
            "[window] key scope done"
        );
        self.completed.push(WindowSummary {
            key: key.to_string(),
            window: finished,
            items,
            reason: reason.to_string(),
        });

        let next = self
            .keys
            .get_mut(key)
            .and_then(|progress| progress.pending.pop_front());

        match next {
            Some(window) => {
                if let Some(progress) = self.keys.get_mut(key) {
                    progress.current = window.clone();
                    progress.phase = WindowPhase::AwaitingFirstPage;
                    progress.items = 0;
                }
                Some(Advance::Next(window))
            }
            None => {
                self.keys.remove(key);
                self.drained.push(key.to_string());
                info!(key, "[window] key drained");
                Some(Advance::Drained)
            }
        }
    }

    /// Keys with a window still in progress
    pub fn active_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn drained_keys(&self) -> &[String] {
        &self.drained
    }

    pub fn completed(&self) -> &[WindowSummary] {
        &self.completed
    }

    fn current_mut(&mut self, key: &str, index: usize) -> Option<&mut KeyProgress> {
        self.keys
            .get_mut(key)
            .filter(|progress| progress.current.index == index)
    }
}
