use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use crate::content::InputPart;
use crate::errors::ProviderError;
use crate::model::ProviderId;

/// Event produced by a provider stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    /// Incremental text output.
    TextDelta { text: String },
    /// End of output. Non-streaming providers deliver their whole body in
    /// `text`; streaming providers usually leave it empty.
    Completed {
        text: Option<String>,
        finish_reason: Option<String>,
    },
}

/// Boxed provider event stream.
pub type ProviderEventStream =
    Pin<Box<dyn futures::Stream<Item = Result<ProviderEvent, ProviderError>> + Send + 'static>>;

/// Vendor metadata captured when a stream starts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderResponseMeta {
    /// Vendor-side request id, when the vendor returns one.
    pub vendor_request_id: Option<String>,
}

/// Started provider stream.
pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub metadata: ProviderResponseMeta,
}

/// One attempt's request as seen by an adapter.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub request_id: uuid::Uuid,
    /// 1-based attempt number within the request.
    pub attempt: u32,
    pub model: String,
    pub system_prompt: Option<String>,
    pub input_parts: Vec<InputPart>,
    /// Time left before the request deadline when the attempt started.
    pub timeout: Option<Duration>,
    pub vendor_options: HashMap<ProviderId, serde_json::Value>,
}

/// Uniform interface to one generation backend.
///
/// Adapters hold no document state; their only side effect is the network call.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn start_stream(&self, req: ProviderRequest)
    -> Result<ProviderStreamHandle, ProviderError>;
}
