//! Multi-provider generation harness with streaming failover.
//!
//! Providers are registered with a priority; a request is attempted on the
//! first eligible provider and transparently moves to the next one on a
//! transient failure. Every attempt's output is tagged with its attempt number
//! so consumers can discard the output of abandoned attempts.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use orionix_ai_harness::prelude::*;
//! use orionix_ai_harness::vendors::openai_compat::{OpenAiCompatProvider, VendorPreset};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), HarnessError> {
//! let harness = Harness::builder()
//!     .register_provider(
//!         ProviderSpec::new("deepseek", "deepseek-chat").priority(1),
//!         Arc::new(OpenAiCompatProvider::from_env(VendorPreset::DeepSeek)?),
//!     )
//!     .register_provider(
//!         ProviderSpec::new("qwen", "qwen-plus").priority(2),
//!         Arc::new(OpenAiCompatProvider::from_env(VendorPreset::Qwen)?),
//!     )
//!     .build()?;
//!
//! let text = harness
//!     .run()
//!     .system_prompt("Answer briefly.")
//!     .user_text("Say hello")
//!     .deadline(std::time::Duration::from_secs(30))
//!     .collect_text()
//!     .await?;
//!
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

/// Input/output content types and final run output helpers.
pub mod content;
/// Public error types and failure classification.
pub mod errors;
/// Harness entry point and builder.
pub mod harness;
/// Provider health tracking.
pub mod health;
/// Provider identifiers, registration specs and run options.
pub mod model;
/// Common imports for typical usage.
pub mod prelude;
/// Provider adapter contracts used by vendor integrations.
pub mod provider;
/// Run builder, failover task, streaming handle and cancellation handle.
pub mod run;
/// Normalized public stream events.
pub mod stream;
/// Vendor-specific integrations and extension traits.
pub mod vendors;

pub use content::{InputPart, OutputPart, RunOutput};
pub use errors::{AttemptFailure, FailureClass, GenerationFailure, HarnessError, ProviderError};
pub use harness::{Harness, HarnessBuilder, ProviderStatus};
pub use health::{HealthPolicy, HealthRegistry, HealthSnapshot, Outcome};
pub use model::{HealthState, ProviderCapabilities, ProviderId, ProviderSpec, RunOptions};
pub use provider::{
    ProviderAdapter, ProviderEvent, ProviderEventStream, ProviderRequest, ProviderResponseMeta,
    ProviderStreamHandle,
};
pub use run::{AbortHandle, RunBuilder, RunStream};
pub use stream::{FailoverEvent, OrchestrationState, StreamChunk};
