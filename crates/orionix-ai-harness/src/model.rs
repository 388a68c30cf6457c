use std::fmt;
use std::time::Duration;

/// Stable identifier for a provider implementation (for example `deepseek`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// What a provider can do.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderCapabilities {
    /// Emits incremental text deltas rather than one final body.
    pub streaming: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self { streaming: true }
    }
}

/// Registration record for one provider.
///
/// Lower `priority` values are tried first. Disabled providers stay registered
/// but are never attempted.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderSpec {
    pub id: ProviderId,
    /// Provider-specific model name (for example `deepseek-chat`).
    pub model: String,
    pub priority: u32,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
    pub enabled: bool,
}

impl ProviderSpec {
    pub fn new(id: impl Into<ProviderId>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            priority: 0,
            capabilities: ProviderCapabilities::default(),
            enabled: true,
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.capabilities.streaming = streaming;
        self
    }
}

/// Provider health as tracked by the failover orchestrator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

impl HealthState {
    /// Whether a provider in this state may be attempted.
    pub fn is_eligible(self) -> bool {
        !matches!(self, HealthState::Unavailable)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unavailable => "unavailable",
        })
    }
}

/// Generic run behavior options.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RunOptions {
    /// Wall-clock budget for the whole request across all attempts.
    pub deadline: Duration,
    /// An attempt is not started with less time than this left.
    pub min_attempt_budget: Duration,
    /// Bounded event buffer size used by the streaming channel.
    pub stream_buffer_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(120),
            min_attempt_budget: Duration::ZERO,
            stream_buffer_capacity: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_options_defaults() {
        let options = RunOptions::default();
        assert_eq!(options.stream_buffer_capacity, 128);
        assert_eq!(options.deadline, Duration::from_secs(120));
        assert!(options.min_attempt_budget.is_zero());
    }

    #[test]
    fn only_unavailable_is_ineligible() {
        assert!(HealthState::Healthy.is_eligible());
        assert!(HealthState::Degraded.is_eligible());
        assert!(!HealthState::Unavailable.is_eligible());
    }
}
