//! Generation sessions that stream failover output into scene documents.
//!
//! [`Studio`] ties a provider [`Harness`](orionix_ai_harness::Harness) to a
//! [`SceneStore`](orionix_scene::SceneStore). Each [`Session`] submits prompts
//! whose streamed output becomes patches committed through the document's edit
//! gate, interleaved safely with manual edits.
//!
//! ```no_run
//! use orionix_studio::{GenerationRequest, Studio, StudioConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StudioConfig::load(None)?;
//! let studio = Studio::from_config(&config, config.build_harness()?);
//! let doc = studio.create_document("bakery");
//! let session = studio.open_session(doc)?;
//!
//! let mut handle = session
//!     .submit(GenerationRequest::new("A landing page for a small bakery"))
//!     .await?;
//! while let Some(event) = handle.next_event().await {
//!     println!("{}", event.to_json()?);
//! }
//! # Ok(())
//! # }
//! ```

/// Studio configuration and `.env` loading.
pub mod config;
/// Sessions, the edit gate and the generation pump.
pub mod coordinator;
/// Generation stream and document API wire types.
pub mod events;
/// Tracing subscriber setup.
pub mod observability;
/// Scripted providers for runs without API keys.
pub mod offline;
/// System prompt and request input assembly.
pub mod prompt;

pub use config::{ConfigError, ProviderConfig, StudioConfig};
pub use coordinator::{
    CancelHandle, GenerationHandle, GenerationRequest, GenerationSummary, Session, SessionError,
    SessionState, Studio,
};
pub use events::{
    ChunkPayload, ErrorPayload, GenerationEvent, PatchPayload, PatchResponse, StatusPayload,
};
