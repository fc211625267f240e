//! Credential records and the credential pool

use crate::config::{resolve_token, CredentialEntry};
use crate::ConfigError;
use chrono::{DateTime, Utc};
use std::fmt;

/// Cookie key holding the auxiliary anti-forgery token
const XSRF_KEY: &str = "XSRF-TOKEN";

/// Lifecycle state of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialState {
    /// Eligible for selection
    Active,

    /// Suspended until its cooldown expires
    Cooldown,

    /// Permanently out of rotation
    Retired,
}

impl CredentialState {
    /// Returns true if the credential can never be selected again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Retired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooldown => "cooldown",
            Self::Retired => "retired",
        }
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A proxy endpoint bound to one credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBinding {
    pub uri: String,
    pub bound_at: DateTime<Utc>,
}

/// One account in the pool, with its health and proxy bookkeeping
#[derive(Debug, Clone)]
pub struct Credential {
    pub label: String,

    /// Secret cookie-style token sent as the `Cookie` header
    pub token: String,

    /// Derived from the token once, at construction
    pub xsrf_token: Option<String>,

    /// Consecutive failures since the last success or reactivation
    pub failure_streak: u32,

    pub cooldown_until: Option<DateTime<Utc>>,

    /// Cooldowns entered so far
    pub cooldown_cycles: u32,

    pub state: CredentialState,

    /// Advances on every state transition; requests remember the epoch they
    /// were dispatched in
    pub epoch: u64,

    pub proxy: Option<ProxyBinding>,

    /// Requests dispatched with this credential
    pub request_count: u64,
}

impl Credential {
    pub fn new(label: impl Into<String>, token: impl Into<String>) -> Self {
        let token = token.into();
        let xsrf_token = extract_xsrf_token(&token);
        Self {
            label: label.into(),
            token,
            xsrf_token,
            failure_streak: 0,
            cooldown_until: None,
            cooldown_cycles: 0,
            state: CredentialState::Active,
            epoch: 0,
            proxy: None,
            request_count: 0,
        }
    }

    /// Headers that authenticate a request with this credential
    pub fn auth_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("Cookie".to_string(), self.token.clone())];
        if let Some(xsrf) = &self.xsrf_token {
            headers.push(("X-XSRF-TOKEN".to_string(), xsrf.clone()));
        }
        headers
    }

    pub fn proxy_uri(&self) -> Option<&str> {
        self.proxy.as_ref().map(|binding| binding.uri.as_str())
    }
}

/// Extracts the `XSRF-TOKEN` value from a `key=value; key=value` token
pub fn extract_xsrf_token(token: &str) -> Option<String> {
    token.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key.trim() == XSRF_KEY && !value.trim().is_empty() {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// The ordered credential pool
///
/// Credentials are never removed; retirement is a state, not a deletion.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    credentials: Vec<Credential>,
}

impl CredentialStore {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    /// Builds the pool from configuration, reading token files as needed
    pub fn from_entries(entries: &[CredentialEntry]) -> Result<Self, ConfigError> {
        let credentials = entries
            .iter()
            .map(|entry| Ok(Credential::new(entry.label.clone(), resolve_token(entry)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self::new(credentials))
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Credential> {
        self.credentials.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Credential> {
        self.credentials.get_mut(index)
    }

    /// Finds a credential's position by label
    pub fn position(&self, label: &str) -> Option<usize> {
        self.credentials.iter().position(|c| c.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.iter()
    }
}
