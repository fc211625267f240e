//! Concurrency lanes keyed by credential and proxy
//!
//! Every request sharing a lane shares one concurrency cap and one pacing
//! schedule, whatever the global in-flight limit is.

use crate::config::EngineConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Identity of a lane: (credential, proxy), either part may be absent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaneKey {
    pub credential: Option<String>,
    pub proxy: Option<String>,
}

impl LaneKey {
    pub fn new(credential: Option<&str>, proxy: Option<&str>) -> Self {
        Self {
            credential: credential.map(str::to_string),
            proxy: proxy.map(str::to_string),
        }
    }

    /// The lane shared by all unauthenticated requests without a proxy
    pub fn anonymous() -> Self {
        Self {
            credential: None,
            proxy: None,
        }
    }
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credential = self.credential.as_deref().unwrap_or("anonymous");
        match &self.proxy {
            Some(proxy) => write!(f, "{}@{}", credential, crate::session::redact_proxy(proxy)),
            None => write!(f, "{}", credential),
        }
    }
}

/// Per-lane concurrency cap and request spacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneLimits {
    pub max_concurrent: usize,
    pub min_spacing: Duration,
}

impl LaneLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_concurrent: config.lane_max_concurrent.max(1),
            min_spacing: Duration::from_millis(config.lane_min_spacing_ms),
        }
    }
}

/// Pacing and concurrency state of one lane
#[derive(Debug, Clone)]
pub struct LaneState {
    /// Requests scheduled on this lane
    pub request_count: u64,

    /// Earliest start time for the next request
    pub next_slot: Option<Instant>,

    permits: Arc<Semaphore>,
}

impl LaneState {
    pub fn new(limits: &LaneLimits) -> Self {
        Self {
            request_count: 0,
            next_slot: None,
            permits: Arc::new(Semaphore::new(limits.max_concurrent)),
        }
    }

    /// Reserves the next start slot at or after `earliest`
    ///
    /// Slots on one lane are at least `min_spacing` apart.
    pub fn reserve_slot(&mut self, limits: &LaneLimits, earliest: Instant) -> Instant {
        let slot = match self.next_slot {
            Some(next) if next > earliest => next,
            _ => earliest,
        };
        self.next_slot = Some(slot + limits.min_spacing);
        self.request_count += 1;
        slot
    }

    /// Time until the lane accepts another request, if it is not ready now
    pub fn time_until_next_slot(&self, now: Instant) -> Option<Duration> {
        match self.next_slot {
            Some(next) if next > now => Some(next - now),
            _ => None,
        }
    }

    /// Pushes the next slot back after a failed request
    pub fn penalize(&mut self, limits: &LaneLimits, now: Instant) {
        let floor = now + limits.min_spacing;
        if self.next_slot.map_or(true, |next| next < floor) {
            self.next_slot = Some(floor);
        }
    }

    pub fn permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }
}

/// A reserved place on a lane
#[derive(Debug, Clone)]
pub struct LaneTicket {
    pub send_at: Instant,
    pub permits: Arc<Semaphore>,
}

/// All lanes seen so far
#[derive(Debug, Clone)]
pub struct LaneTable {
    lanes: HashMap<LaneKey, LaneState>,
    limits: LaneLimits,
}

impl LaneTable {
    pub fn new(limits: LaneLimits) -> Self {
        Self {
            lanes: HashMap::new(),
            limits,
        }
    }

    /// Reserves a slot on the lane, creating the lane on first use
    pub fn reserve(&mut self, key: &LaneKey, earliest: Instant) -> LaneTicket {
        let limits = self.limits;
        let lane = self
            .lanes
            .entry(key.clone())
            .or_insert_with(|| LaneState::new(&limits));
        LaneTicket {
            send_at: lane.reserve_slot(&limits, earliest),
            permits: lane.permits(),
        }
    }

    pub fn penalize(&mut self, key: &LaneKey, now: Instant) {
        let limits = self.limits;
        if let Some(lane) = self.lanes.get_mut(key) {
            lane.penalize(&limits, now);
        }
    }

    /// Forgets a lane; requests already holding its permits are unaffected
    pub fn remove(&mut self, key: &LaneKey) -> Option<LaneState> {
        self.lanes.remove(key)
    }

    pub fn get(&self, key: &LaneKey) -> Option<&LaneState> {
        self.lanes.get(key)
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}
