//! Wire events of the generation and document APIs.

use orionix_ai_harness::ProviderId;
use orionix_scene::{DocumentId, PatchRejected, PatchSource, ScenePatch, StoreError};
use uuid::Uuid;

/// One event of a generation stream.
///
/// Serialized as `{"type": "...", "payload": {...}}`. A stream always ends
/// with exactly one `status` event whose status is `succeeded` or `failed`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum GenerationEvent {
    Chunk(ChunkPayload),
    Patch(PatchPayload),
    Status(StatusPayload),
    Error(ErrorPayload),
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkPayload {
    pub request_id: Uuid,
    pub provider: ProviderId,
    pub attempt: u32,
    pub seq: u64,
    pub text: String,
}

/// A patch committed to the document, including revocation patches.
///
/// The source carries the request id and attempt.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PatchPayload {
    pub revision: u64,
    #[serde(flatten)]
    pub source: PatchSource,
    pub patch: ScenePatch,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusPayload {
    Started {
        request_id: Uuid,
        document_id: DocumentId,
    },
    Attempt {
        request_id: Uuid,
        attempt: u32,
        provider: ProviderId,
    },
    /// An abandoned attempt's committed patches were undone.
    AttemptRevoked {
        request_id: Uuid,
        attempt: u32,
        provider: ProviderId,
        reason: String,
        revoked: u64,
        /// Inverses that no longer applied after intervening manual edits.
        skipped: u64,
    },
    Succeeded {
        request_id: Uuid,
        provider: ProviderId,
        attempt: u32,
        revision: u64,
        committed: u64,
    },
    Failed {
        request_id: Uuid,
        code: String,
        message: String,
        revision: u64,
        /// Patches of the last attempt that stay in the document.
        committed: u64,
        note: String,
    },
}

impl StatusPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusPayload::Succeeded { .. } | StatusPayload::Failed { .. }
        )
    }
}

/// Non-fatal problem inside a generation; the stream continues.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub request_id: Uuid,
    pub attempt: u32,
    pub code: String,
    pub message: String,
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationEvent::Status(status) if status.is_terminal())
    }

    /// Event name used for SSE framing.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationEvent::Chunk(_) => "chunk",
            GenerationEvent::Patch(_) => "patch",
            GenerationEvent::Status(_) => "status",
            GenerationEvent::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Frames the event as one server-sent event.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        Ok(format!("event: {}\ndata: {}\n\n", self.kind(), self.to_json()?))
    }
}

/// Response of `patch document/{id}`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PatchResponse {
    Applied { revision: u64 },
    Rejected { rejected: bool, code: String, reason: String },
}

impl PatchResponse {
    pub fn rejected(reason: &PatchRejected) -> Self {
        PatchResponse::Rejected {
            rejected: true,
            code: reason.code().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Maps an apply result; errors other than rejection are passed through.
    pub fn from_apply(result: Result<u64, StoreError>) -> Result<Self, StoreError> {
        match result {
            Ok(revision) => Ok(PatchResponse::Applied { revision }),
            Err(StoreError::Rejected(reason)) => Ok(PatchResponse::rejected(&reason)),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orionix_scene::NodeId;
    use serde_json::json;

    #[test]
    fn events_use_type_and_payload() {
        let request_id = Uuid::nil();
        let event = GenerationEvent::Status(StatusPayload::Failed {
            request_id,
            code: "cancelled".into(),
            message: "run cancelled".into(),
            revision: 4,
            committed: 2,
            note: "committed patches are kept".into(),
        });
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["type"], json!("status"));
        assert_eq!(value["payload"]["status"], json!("failed"));
        assert_eq!(value["payload"]["code"], json!("cancelled"));
        assert!(event.is_terminal());
    }

    #[test]
    fn patch_event_carries_source_and_revision() {
        let event = GenerationEvent::Patch(PatchPayload {
            revision: 3,
            source: PatchSource::Ai {
                request_id: Uuid::nil(),
                attempt: 2,
            },
            patch: ScenePatch::Delete {
                target: NodeId::new(5),
            },
        });
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["payload"]["source"], json!("ai"));
        assert_eq!(value["payload"]["attempt"], json!(2));
        assert_eq!(value["payload"]["request_id"], json!(Uuid::nil()));
        assert_eq!(value["payload"]["patch"]["op"], json!("delete"));
        assert_eq!(value["payload"]["patch"]["target"], json!("n5"));

        let sse = event.to_sse().expect("sse");
        assert!(sse.starts_with("event: patch\ndata: {"));
        assert!(sse.ends_with("\n\n"));
    }

    #[test]
    fn patch_response_shapes() {
        let applied = PatchResponse::from_apply(Ok(7)).expect("applied");
        assert_eq!(serde_json::to_value(&applied).expect("json"), json!({"revision": 7}));

        let rejected = PatchResponse::from_apply(Err(StoreError::Rejected(
            PatchRejected::NodeNotFound(NodeId::new(9)),
        )))
        .expect("rejected");
        let value = serde_json::to_value(&rejected).expect("json");
        assert_eq!(value["rejected"], json!(true));
        assert_eq!(value["code"], json!("node_not_found"));
    }
}
