//! Session management: credentials, proxies, health, and lanes
//!
//! This module decides who a request is sent as and through which proxy:
//! - Credential pool with derived XSRF tokens
//! - Health tracking (active → cooldown → retired)
//! - Per-credential proxy binding with periodic rotation
//! - Concurrency lanes keyed by credential and proxy
//! - The dispatcher tying these together for each request

mod credential;
mod dispatcher;
mod health;
mod lane;
mod proxy;

pub use credential::{extract_xsrf_token, Credential, CredentialState, CredentialStore, ProxyBinding};
pub use dispatcher::{Preparation, PreparedRequest, SessionDispatcher};
pub use health::{CredentialHealthTracker, HealthTransition, Outcome};
pub use lane::{LaneKey, LaneLimits, LaneState, LaneTable, LaneTicket};
pub use proxy::{redact_proxy, ProxyAllocator, ProxyResolution};
