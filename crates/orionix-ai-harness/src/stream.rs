use crate::content::RunOutput;
use crate::errors::{GenerationFailure, ProviderError};
use crate::model::ProviderId;

/// Ordered fragment of one attempt's raw output.
///
/// `seq` starts at 0 for every attempt; chunks of different attempts are
/// never mixed.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamChunk {
    pub provider: ProviderId,
    pub attempt: u32,
    pub seq: u64,
    pub text: String,
}

/// Where a request is in the failover state machine.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrchestrationState {
    Idle,
    Attempting { provider: ProviderId, attempt: u32 },
    /// The given attempt failed transiently; the next candidate is being chosen.
    Retrying { attempt: u32 },
    Succeeded { provider: ProviderId, attempt: u32 },
    ExhaustedFailed,
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationState::Succeeded { .. } | OrchestrationState::ExhaustedFailed
        )
    }
}

/// Normalized events exposed by `RunStream`.
#[derive(Clone, Debug, PartialEq)]
pub enum FailoverEvent {
    /// A provider attempt began. Chunks that follow belong to it.
    AttemptStarted {
        request_id: uuid::Uuid,
        attempt: u32,
        provider: ProviderId,
    },
    Chunk {
        request_id: uuid::Uuid,
        chunk: StreamChunk,
    },
    /// The attempt failed transiently; its output must be discarded.
    AttemptAbandoned {
        request_id: uuid::Uuid,
        attempt: u32,
        provider: ProviderId,
        reason: ProviderError,
    },
    /// Terminal success event with the winning attempt's output.
    Succeeded {
        request_id: uuid::Uuid,
        output: RunOutput,
    },
    /// Terminal failure event.
    Failed {
        request_id: uuid::Uuid,
        failure: GenerationFailure,
    },
}

impl FailoverEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailoverEvent::Succeeded { .. } | FailoverEvent::Failed { .. }
        )
    }
}
