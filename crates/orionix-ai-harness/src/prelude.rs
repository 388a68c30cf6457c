//! Common imports for typical harness usage.
pub use crate::{
    AbortHandle, FailoverEvent, GenerationFailure, Harness, HarnessBuilder, HarnessError,
    HealthState, InputPart, OrchestrationState, ProviderId, ProviderSpec, RunBuilder, RunOutput,
    RunStream, StreamChunk,
};
