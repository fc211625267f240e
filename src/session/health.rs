//! Credential health tracking: active → cooldown → retired

use crate::config::HealthConfig;
use crate::session::credential::{Credential, CredentialState};
use chrono::{DateTime, Duration, Utc};

/// Result of one request, as far as credential health is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,

    /// HTTP 401/403
    AuthFailure,

    /// Connection error or timeout
    NetworkFailure,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// State change caused by recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Cooldown {
        until: DateTime<Utc>,
        cycle: u32,
        streak: u32,
    },
    Retired {
        cycles: u32,
        streak: u32,
    },
}

/// Drives credential state from request outcomes
#[derive(Debug, Clone)]
pub struct CredentialHealthTracker {
    failure_threshold: u32,
    cooldown: Duration,
    max_cooldown_cycles: u32,
}

impl CredentialHealthTracker {
    pub fn new(failure_threshold: u32, cooldown: Duration, max_cooldown_cycles: u32) -> Self {
        Self {
            failure_threshold,
            cooldown,
            max_cooldown_cycles,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::seconds(config.cooldown_secs as i64),
            config.max_cooldown_cycles,
        )
    }

    /// Records a request outcome against a credential
    ///
    /// A streak longer than the failure threshold starts a cooldown, and the
    /// cooldown that reaches the cycle limit retires the credential instead.
    /// `epoch` is the credential's epoch when the request was dispatched;
    /// failures from an earlier epoch belong to a streak that was already
    /// acted on and are not counted again.
    pub fn record_outcome(
        &self,
        credential: &mut Credential,
        outcome: Outcome,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> HealthTransition {
        if outcome == Outcome::Success {
            credential.failure_streak = 0;
            return HealthTransition::Unchanged;
        }

        if epoch != credential.epoch || credential.state != CredentialState::Active {
            return HealthTransition::Unchanged;
        }

        credential.failure_streak += 1;
        if credential.failure_streak <= self.failure_threshold {
            return HealthTransition::Unchanged;
        }

        let streak = credential.failure_streak;
        credential.failure_streak = 0;
        credential.cooldown_cycles += 1;
        credential.epoch += 1;

        if credential.cooldown_cycles >= self.max_cooldown_cycles {
            credential.state = CredentialState::Retired;
            credential.cooldown_until = None;
            tracing::error!(
                credential = %credential.label,
                cycles = credential.cooldown_cycles,
                streak,
                ?outcome,
                "Credential retired"
            );
            HealthTransition::Retired {
                cycles: credential.cooldown_cycles,
                streak,
            }
        } else {
            let until = now + self.cooldown;
            credential.state = CredentialState::Cooldown;
            credential.cooldown_until = Some(until);
            tracing::warn!(
                credential = %credential.label,
                cycle = credential.cooldown_cycles,
                streak,
                until = %until,
                ?outcome,
                "Credential entering cooldown"
            );
            HealthTransition::Cooldown {
                until,
                cycle: credential.cooldown_cycles,
                streak,
            }
        }
    }

    /// Returns true if the credential may be selected now
    ///
    /// An expired cooldown reactivates the credential as a side effect.
    pub fn is_available(&self, credential: &mut Credential, now: DateTime<Utc>) -> bool {
        match credential.state {
            CredentialState::Active => true,
            CredentialState::Retired => false,
            CredentialState::Cooldown => match credential.cooldown_until {
                Some(until) if now < until => false,
                _ => {
                    credential.state = CredentialState::Active;
                    credential.failure_streak = 0;
                    credential.cooldown_until = None;
                    credential.epoch += 1;
                    tracing::info!(credential = %credential.label, "Credential cooldown expired");
                    true
                }
            },
        }
    }
}

impl Default for CredentialHealthTracker {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}
