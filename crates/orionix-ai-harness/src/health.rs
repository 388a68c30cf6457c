//! Provider health tracking.
//!
//! One transient failure degrades a provider; `failure_threshold` consecutive
//! transient failures make it unavailable for `cooldown`. When the cooldown
//! elapses the provider is half-open: degraded, with its streak cleared, so a
//! single further failure does not immediately bench it again. A success
//! restores it to healthy. Terminal failures say nothing about the provider and
//! leave health untouched.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::model::{HealthState, ProviderId};

/// Thresholds governing health transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Outcome of one attempt, fed to [`HealthRegistry::record`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Transient(String),
    Terminal,
}

#[derive(Clone, Debug)]
struct Entry {
    state: HealthState,
    consecutive_failures: u32,
    unavailable_until: Option<Instant>,
    last_failure: Option<String>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            unavailable_until: None,
            last_failure: None,
        }
    }

    /// Moves an unavailable entry to half-open once its cooldown has passed.
    fn refresh(&mut self, now: Instant) {
        if let Some(until) = self.unavailable_until
            && now >= until
        {
            self.state = HealthState::Degraded;
            self.consecutive_failures = 0;
            self.unavailable_until = None;
        }
    }
}

/// Point-in-time view of one provider's health.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct HealthSnapshot {
    pub provider: ProviderId,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
}

/// Lock-guarded health of every registered provider.
pub struct HealthRegistry {
    policy: HealthPolicy,
    entries: Mutex<HashMap<ProviderId, Entry>>,
}

impl HealthRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    pub(crate) fn register(&self, provider: ProviderId) {
        self.entries.lock().entry(provider).or_insert_with(Entry::new);
    }

    /// Current state; unknown providers read as healthy.
    pub fn state(&self, provider: &ProviderId) -> HealthState {
        self.snapshot(provider).state
    }

    pub fn snapshot(&self, provider: &ProviderId) -> HealthSnapshot {
        let mut entries = self.entries.lock();
        let entry = entries.entry(provider.clone()).or_insert_with(Entry::new);
        entry.refresh(Instant::now());
        HealthSnapshot {
            provider: provider.clone(),
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
            last_failure: entry.last_failure.clone(),
        }
    }

    /// Applies one attempt outcome and returns the resulting state.
    pub fn record(&self, provider: &ProviderId, outcome: Outcome) -> HealthState {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(provider.clone()).or_insert_with(Entry::new);
        entry.refresh(now);
        let before = entry.state;
        match outcome {
            Outcome::Success => {
                entry.state = HealthState::Healthy;
                entry.consecutive_failures = 0;
                entry.unavailable_until = None;
            }
            Outcome::Transient(reason) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_failure = Some(reason);
                if entry.consecutive_failures >= self.policy.failure_threshold {
                    entry.state = HealthState::Unavailable;
                    entry.unavailable_until = Some(now + self.policy.cooldown);
                } else {
                    entry.state = HealthState::Degraded;
                }
            }
            Outcome::Terminal => {}
        }
        let after = entry.state;
        if before != after {
            match after {
                HealthState::Unavailable => warn!(
                    provider = %provider,
                    failures = entry.consecutive_failures,
                    cooldown_ms = self.policy.cooldown.as_millis() as u64,
                    "provider marked unavailable"
                ),
                _ => info!(provider = %provider, from = %before, to = %after, "provider health changed"),
            }
        }
        after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(cooldown: Duration) -> HealthRegistry {
        HealthRegistry::new(HealthPolicy {
            failure_threshold: 3,
            cooldown,
        })
    }

    #[test]
    fn single_transient_degrades_and_success_restores() {
        let health = registry(Duration::from_secs(30));
        let p = ProviderId::new("p1");
        assert_eq!(
            health.record(&p, Outcome::Transient("503".into())),
            HealthState::Degraded
        );
        assert_eq!(health.record(&p, Outcome::Success), HealthState::Healthy);
        assert_eq!(health.snapshot(&p).consecutive_failures, 0);
    }

    #[test]
    fn terminal_failures_leave_health_untouched() {
        let health = registry(Duration::from_secs(30));
        let p = ProviderId::new("p1");
        assert_eq!(health.record(&p, Outcome::Terminal), HealthState::Healthy);
    }

    #[tokio::test]
    async fn three_transients_bench_until_cooldown_then_half_open() {
        let health = registry(Duration::from_millis(40));
        let p = ProviderId::new("p1");
        for _ in 0..2 {
            health.record(&p, Outcome::Transient("timeout".into()));
        }
        assert_eq!(health.state(&p), HealthState::Degraded);
        health.record(&p, Outcome::Transient("timeout".into()));
        assert_eq!(health.state(&p), HealthState::Unavailable);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let snap = health.snapshot(&p);
        assert_eq!(snap.state, HealthState::Degraded);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.last_failure.as_deref(), Some("timeout"));
    }
}
