use std::fmt;

use crate::model::ProviderId;

/// Whether a failed attempt may be retried on another provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Timeout, rate limit, server error, transport failure or malformed stream.
    Transient,
    /// Invalid request or content-policy rejection; surfaced to the caller.
    Terminal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureClass::Transient => "transient",
            FailureClass::Terminal => "terminal",
        })
    }
}

/// Errors returned by a provider adapter before they are normalized for the
/// public run stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Provider returned an application-level failure (HTTP status, auth, etc.).
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: ProviderId,
        message: String,
        status_code: Option<u16>,
    },
    /// Transport or stream I/O failed.
    #[error("transport error ({provider}): {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    /// Provider response shape or event sequencing was invalid.
    #[error("protocol error ({provider}): {message}")]
    Protocol {
        provider: ProviderId,
        message: String,
    },
    /// The attempt ran past its time budget.
    #[error("timeout ({provider}) after {after_ms} ms")]
    Timeout { provider: ProviderId, after_ms: u64 },
    /// The provider refused the content (policy rejection).
    #[error("rejected by provider ({provider}): {message}")]
    Rejected {
        provider: ProviderId,
        message: String,
    },
}

impl ProviderError {
    /// Creates a provider-level error.
    pub fn provider(
        provider: impl Into<ProviderId>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transport-level error.
    pub fn transport(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Protocol {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn timeout(provider: impl Into<ProviderId>, after_ms: u64) -> Self {
        Self::Timeout {
            provider: provider.into(),
            after_ms,
        }
    }

    /// Creates a content-policy rejection.
    pub fn rejected(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Rejected {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Returns the provider associated with this error.
    pub fn provider_id(&self) -> &ProviderId {
        match self {
            Self::Provider { provider, .. }
            | Self::Transport { provider, .. }
            | Self::Protocol { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Rejected { provider, .. } => provider,
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> String {
        match self {
            Self::Provider { message, .. }
            | Self::Transport { message, .. }
            | Self::Protocol { message, .. }
            | Self::Rejected { message, .. } => message.clone(),
            Self::Timeout { after_ms, .. } => format!("timed out after {after_ms} ms"),
        }
    }

    /// Classifies the failure for failover.
    ///
    /// Auth failures (401/403) count as transient: another provider may be
    /// configured correctly.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Provider {
                status_code: Some(status),
                ..
            } => match status {
                401 | 403 | 408 | 409 | 425 | 429 => FailureClass::Transient,
                400..=499 => FailureClass::Terminal,
                _ => FailureClass::Transient,
            },
            Self::Provider {
                status_code: None, ..
            }
            | Self::Transport { .. }
            | Self::Protocol { .. }
            | Self::Timeout { .. } => FailureClass::Transient,
            Self::Rejected { .. } => FailureClass::Terminal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// One failed provider attempt, as reported in aggregated failures.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttemptFailure {
    pub provider: ProviderId,
    pub attempt: u32,
    pub class: FailureClass,
    pub message: String,
}

impl AttemptFailure {
    pub(crate) fn new(attempt: u32, err: &ProviderError) -> Self {
        Self {
            provider: err.provider_id().clone(),
            attempt,
            class: err.class(),
            message: err.message(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({}): {}",
            self.attempt, self.provider, self.class, self.message
        )
    }
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no attempts".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Terminal failure of a generation request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationFailure {
    /// The request deadline passed before any attempt succeeded.
    #[error("deadline exceeded after {elapsed_ms} ms ({})", summarize(.attempts))]
    DeadlineExceeded {
        elapsed_ms: u64,
        attempts: Vec<AttemptFailure>,
    },
    /// Every eligible provider failed transiently, or none was eligible.
    #[error("no provider available ({})", summarize(.attempts))]
    ProviderExhausted { attempts: Vec<AttemptFailure> },
    /// A provider returned a non-retryable failure.
    #[error("provider {provider} rejected the request: {message}")]
    TerminalProvider {
        provider: ProviderId,
        attempt: u32,
        message: String,
    },
    /// The run was cancelled by the caller.
    #[error("run cancelled")]
    Cancelled,
    /// The harness detected an invariant error.
    #[error("internal failure: {message}")]
    Internal { message: String },
}

impl GenerationFailure {
    /// Stable reason code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::ProviderExhausted { .. } => "provider_exhausted",
            Self::TerminalProvider { .. } => "provider_rejected",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Top-level error type for the public harness API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HarnessError {
    /// Invalid harness/provider configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid user input to the builder API.
    #[error("validation error: {0}")]
    Validation(String),
    /// Requested provider is not registered in the harness.
    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: ProviderId },
    /// Terminal failure returned from a started run.
    #[error(transparent)]
    Generation(GenerationFailure),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HarnessError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<GenerationFailure> for HarnessError {
    fn from(value: GenerationFailure) -> Self {
        HarnessError::Generation(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_classified() {
        let class = |status| ProviderError::provider("p", "x", Some(status)).class();
        assert_eq!(class(429), FailureClass::Transient);
        assert_eq!(class(503), FailureClass::Transient);
        assert_eq!(class(401), FailureClass::Transient);
        assert_eq!(class(400), FailureClass::Terminal);
        assert_eq!(class(422), FailureClass::Terminal);
    }

    #[test]
    fn transport_timeout_and_rejection_classes() {
        assert!(ProviderError::transport("p", "reset").is_transient());
        assert!(ProviderError::protocol("p", "bad frame").is_transient());
        assert!(ProviderError::timeout("p", 100).is_transient());
        assert!(!ProviderError::rejected("p", "policy").is_transient());
    }

    #[test]
    fn exhausted_without_attempts_reads_no_provider_available() {
        let failure = GenerationFailure::ProviderExhausted { attempts: vec![] };
        assert_eq!(failure.code(), "provider_exhausted");
        assert_eq!(failure.to_string(), "no provider available (no attempts)");
    }

    #[test]
    fn failures_serialize_with_kind_tag() {
        let value = serde_json::to_value(GenerationFailure::Cancelled).expect("serialize");
        assert_eq!(value, serde_json::json!({"kind": "cancelled"}));
    }
}
