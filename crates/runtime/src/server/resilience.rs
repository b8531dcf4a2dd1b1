//! Gate in front of every outbound generation call.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use librarian_config::{PolicyConfig, ResilienceConfig};

use crate::protocol::ErrorCode;

/// Why an outbound call was refused before it was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("outbound calls are disabled (local-only mode)")]
    LocalOnly,
    #[error("outbound calls are disallowed by trust policy")]
    TrustPolicyBlock,
    #[error("circuit breaker open until {until}")]
    BreakerOpen { until: DateTime<Utc> },
    #[error("backing off until {until}")]
    BackoffActive { until: DateTime<Utc> },
}

impl Rejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            Rejection::LocalOnly => ErrorCode::LocalOnly,
            Rejection::TrustPolicyBlock => ErrorCode::TrustPolicyBlock,
            Rejection::BreakerOpen { .. } => ErrorCode::BreakerOpen,
            Rejection::BackoffActive { .. } => ErrorCode::BackoffActive,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicySnapshot {
    pub failure_count: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub breaker_until: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Consecutive-failure tracking with exponential backoff and a circuit
/// breaker.  Times are passed in so the schedule can be driven by tests.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    config: ResilienceConfig,
    state: PolicySnapshot,
}

impl ResiliencePolicy {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            state: PolicySnapshot::default(),
        }
    }

    /// Static gates first, then the breaker, then backoff.
    pub fn check(&self, policy: &PolicyConfig, now: DateTime<Utc>) -> Result<(), Rejection> {
        if policy.local_only {
            return Err(Rejection::LocalOnly);
        }
        if !policy.allow_outbound {
            return Err(Rejection::TrustPolicyBlock);
        }
        if let Some(until) = self.state.breaker_until.filter(|until| now < *until) {
            return Err(Rejection::BreakerOpen { until });
        }
        if let Some(until) = self.state.backoff_until.filter(|until| now < *until) {
            return Err(Rejection::BackoffActive { until });
        }
        Ok(())
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.state.failure_count = 0;
        self.state.backoff_until = None;
        self.state.breaker_until = None;
        self.state.last_success_at = Some(now);
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.state.failure_count = self.state.failure_count.saturating_add(1);
        self.state.last_failure_at = Some(now);

        let candidate = now + self.backoff_delay(self.state.failure_count);
        self.state.backoff_until = Some(match self.state.backoff_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });

        let threshold = self.config.breaker_threshold;
        if threshold > 0 && self.state.failure_count >= threshold {
            let until = now + secs(self.config.breaker_cooldown_secs);
            self.state.breaker_until = Some(match self.state.breaker_until {
                Some(existing) if existing > until => existing,
                _ => until,
            });
        }
    }

    /// `base * 2^(n-1)`, capped at the configured maximum.
    fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let raw = self
            .config
            .backoff_base_secs
            .saturating_mul(1u64 << exponent);
        secs(raw.min(self.config.backoff_max_secs))
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        self.state.clone()
    }
}

/// Windows longer than this are clamped so deadline arithmetic cannot overflow.
const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 3600;

fn secs(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_WINDOW_SECS) as i64)
}
