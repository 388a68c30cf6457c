//! Generation sessions over scene documents.
//!
//! A [`Session`] binds one client to one document. Each submitted prompt runs
//! through the harness; a pump task feeds the active attempt's chunks to a
//! [`PatchTranslator`] and commits the resulting patches under the document's
//! edit gate, the same gate manual edits take. When the harness fails over to
//! another provider, the patches the abandoned attempt committed are revoked
//! (inverses applied newest first) before the next attempt starts. The last
//! attempt's patches always stand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use orionix_ai_harness::{
    AbortHandle, FailoverEvent, Harness, HarnessError, ProviderError, ProviderId, RunOutput,
    RunStream, StreamChunk,
};
use orionix_scene::{
    DocumentExport, DocumentId, DocumentIdSource, DocumentSnapshot, NodeId, PatchSource,
    PatchTranslator, SceneStore, ScenePatch, StoreError, TranslationStats,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StudioConfig;
use crate::events::{
    ChunkPayload, ErrorPayload, GenerationEvent, PatchPayload, PatchResponse, StatusPayload,
};
use crate::prompt::{SYSTEM_PROMPT, build_input};

const DEFAULT_EVENT_CAPACITY: usize = 128;
const FORWARD_ONLY_NOTE: &str = "patches committed by the last attempt are kept and were not rolled back";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is closed")]
    Closed(Uuid),
    #[error("generation {request_id} is still running in this session")]
    Busy { request_id: Uuid },
    #[error("idempotency token already used by request {request_id}")]
    DuplicateRequest { request_id: Uuid },
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Observable state of a session.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// `attempt` is 0 and `provider` unset until the first attempt starts.
    Generating {
        request_id: Uuid,
        attempt: u32,
        provider: Option<ProviderId>,
    },
    Closed,
}

/// One prompt submission.
#[derive(Clone, Debug, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub idempotency_token: Option<String>,
    /// Harness default when unset.
    pub deadline: Option<Duration>,
    pub preferred_provider: Option<ProviderId>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn idempotency_token(mut self, token: impl Into<String>) -> Self {
        self.idempotency_token = Some(token.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn preferred_provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }
}

/// Stops a generation: no further chunks or patches are forwarded.
///
/// Already committed patches stay in the document.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// What a finished generation did to the document.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct GenerationSummary {
    pub request_id: Uuid,
    /// The terminal `succeeded` or `failed` status that closed the stream.
    pub status: StatusPayload,
    pub attempts: u32,
    pub revoked: u64,
    pub skipped: u64,
    pub translation: TranslationStats,
}

impl GenerationSummary {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, StatusPayload::Succeeded { .. })
    }
}

/// Client side of one running generation.
///
/// Dropping the handle does not cancel the generation; use [`cancel`].
///
/// [`cancel`]: GenerationHandle::cancel
pub struct GenerationHandle {
    request_id: Uuid,
    events: mpsc::Receiver<GenerationEvent>,
    summary: oneshot::Receiver<GenerationSummary>,
    cancel: CancelHandle,
}

impl GenerationHandle {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Next event, or `None` once the terminal status has been delivered.
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drains remaining events and waits for the summary.
    pub async fn finish(mut self) -> Result<GenerationSummary, SessionError> {
        while self.events.recv().await.is_some() {}
        self.summary.await.map_err(|_| {
            SessionError::Internal(format!(
                "generation {} ended without a summary",
                self.request_id
            ))
        })
    }
}

struct SessionSlot {
    state: SessionState,
    active: Option<CancelHandle>,
    tokens: HashMap<String, Uuid>,
}

struct SessionInner {
    id: Uuid,
    document: DocumentId,
    slot: Mutex<SessionSlot>,
}

impl SessionInner {
    fn set_attempt(&self, request_id: Uuid, attempt: u32, provider: ProviderId) {
        let mut slot = self.slot.lock();
        if matches!(&slot.state, SessionState::Generating { request_id: current, .. } if *current == request_id)
        {
            slot.state = SessionState::Generating {
                request_id,
                attempt,
                provider: Some(provider),
            };
        }
    }

    fn finish(&self, request_id: Uuid) {
        let mut slot = self.slot.lock();
        if matches!(&slot.state, SessionState::Generating { request_id: current, .. } if *current == request_id)
        {
            slot.state = SessionState::Idle;
            slot.active = None;
        }
    }

    fn close(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state == SessionState::Closed {
            return false;
        }
        if let Some(active) = slot.active.take() {
            active.cancel();
        }
        slot.state = SessionState::Closed;
        true
    }
}

struct StudioInner {
    harness: Harness,
    store: SceneStore,
    gates: DashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>,
    sessions: DashMap<Uuid, Arc<SessionInner>>,
    event_capacity: usize,
}

/// Entry point of the generation and document APIs.
#[derive(Clone)]
pub struct Studio {
    inner: Arc<StudioInner>,
}

impl Studio {
    pub fn new(harness: Harness, store: SceneStore) -> Self {
        Self::with_event_capacity(harness, store, DEFAULT_EVENT_CAPACITY)
    }

    /// Builds a studio whose store and event buffers follow `config`.
    pub fn from_config(config: &StudioConfig, harness: Harness) -> Self {
        Self::with_event_capacity(
            harness,
            SceneStore::new(config.notification_capacity),
            config.stream_buffer_capacity,
        )
    }

    fn with_event_capacity(harness: Harness, store: SceneStore, event_capacity: usize) -> Self {
        Self {
            inner: Arc::new(StudioInner {
                harness,
                store,
                gates: DashMap::new(),
                sessions: DashMap::new(),
                event_capacity: event_capacity.max(1),
            }),
        }
    }

    pub fn harness(&self) -> &Harness {
        &self.inner.harness
    }

    pub fn store(&self) -> &SceneStore {
        &self.inner.store
    }

    pub fn create_document(&self, title: impl Into<String>) -> DocumentId {
        self.inner.store.create_document(title)
    }

    pub fn import_document(&self, export: DocumentExport) -> Result<DocumentId, SessionError> {
        Ok(self.inner.store.import(export)?)
    }

    /// `get document/{id}`.
    pub fn get_document(&self, document: DocumentId) -> Result<DocumentSnapshot, SessionError> {
        Ok(self.inner.store.get(document)?)
    }

    pub fn allocate_node_id(&self, document: DocumentId) -> Result<NodeId, SessionError> {
        Ok(self.inner.store.allocate_node_id(document)?)
    }

    /// Applies a manual patch between AI patch applications.
    pub async fn apply_patch(
        &self,
        document: DocumentId,
        patch: ScenePatch,
    ) -> Result<u64, SessionError> {
        let gate = self.gate(document)?;
        let _guard = gate.lock().await;
        let applied = self
            .inner
            .store
            .apply(document, patch, PatchSource::Manual)?;
        Ok(applied.revision)
    }

    /// `patch document/{id}`: a rejection is a response, not an error.
    pub async fn patch_document(
        &self,
        document: DocumentId,
        patch: ScenePatch,
    ) -> Result<PatchResponse, SessionError> {
        let result = match self.apply_patch(document, patch).await {
            Ok(revision) => Ok(revision),
            Err(SessionError::Store(err)) => Err(err),
            Err(other) => return Err(other),
        };
        Ok(PatchResponse::from_apply(result)?)
    }

    pub fn open_session(&self, document: DocumentId) -> Result<Session, SessionError> {
        if !self.inner.store.contains(document) {
            return Err(StoreError::DocumentNotFound(document).into());
        }
        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4(),
            document,
            slot: Mutex::new(SessionSlot {
                state: SessionState::Idle,
                active: None,
                tokens: HashMap::new(),
            }),
        });
        self.inner.sessions.insert(inner.id, inner.clone());
        info!(session_id = %inner.id, document_id = %document, "session opened");
        Ok(Session {
            studio: self.clone(),
            inner,
        })
    }

    /// Open sessions bound to `document`.
    pub fn session_count(&self, document: DocumentId) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|s| s.document == document)
            .count()
    }

    /// Closes every session on `document`, cancelling their generations.
    /// The document and its log stay in the store.
    pub fn close_document(&self, document: DocumentId) -> usize {
        let ids: Vec<Uuid> = self
            .inner
            .sessions
            .iter()
            .filter(|s| s.document == document)
            .map(|s| s.id)
            .collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, session)) = self.inner.sessions.remove(&id)
                && session.close()
            {
                closed += 1;
            }
        }
        self.inner.gates.remove(&document);
        info!(document_id = %document, closed, "document closed");
        closed
    }

    fn gate(&self, document: DocumentId) -> Result<Arc<tokio::sync::Mutex<()>>, SessionError> {
        if !self.inner.store.contains(document) {
            return Err(StoreError::DocumentNotFound(document).into());
        }
        Ok(self
            .inner
            .gates
            .entry(document)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }
}

/// A client's connection to one document.
#[derive(Clone)]
pub struct Session {
    studio: Studio,
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn document_id(&self) -> DocumentId {
        self.inner.document
    }

    pub fn state(&self) -> SessionState {
        self.inner.slot.lock().state.clone()
    }

    /// Starts a generation against the session's document.
    ///
    /// Rejected when the token was already used in this session or another
    /// generation is still running.
    pub async fn submit(&self, request: GenerationRequest) -> Result<GenerationHandle, SessionError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        let document = self.inner.document;
        let snapshot = self.studio.get_document(document)?;
        let gate = self.studio.gate(document)?;
        let request_id = self.reserve(request.idempotency_token.as_deref())?;

        let run = match self.start_run(request_id, &request, &snapshot).await {
            Ok(run) => run,
            Err(err) => {
                let mut slot = self.inner.slot.lock();
                if let Some(token) = &request.idempotency_token {
                    slot.tokens.remove(token);
                }
                if slot.state != SessionState::Closed {
                    slot.state = SessionState::Idle;
                }
                return Err(err);
            }
        };

        let cancel = CancelHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            abort: run.abort_handle(),
        };
        {
            let mut slot = self.inner.slot.lock();
            if slot.state == SessionState::Closed {
                cancel.cancel();
            } else {
                slot.active = Some(cancel.clone());
            }
        }

        let (events_tx, events_rx) = mpsc::channel(self.studio.inner.event_capacity);
        let (summary_tx, summary_rx) = oneshot::channel();
        let pump = Pump {
            store: self.studio.inner.store.clone(),
            gate,
            session: self.inner.clone(),
            document,
            request_id,
            cancel: cancel.clone(),
            events: events_tx,
            translator: PatchTranslator::new(Arc::new(DocumentIdSource::new(
                self.studio.inner.store.clone(),
                document,
            ))),
            attempt: 0,
            committed: Vec::new(),
            created: HashSet::new(),
            abandoned: None,
            revoked: 0,
            skipped: 0,
        };
        info!(session_id = %self.inner.id, request_id = %request_id, document_id = %document, "generation submitted");
        tokio::spawn(async move {
            let summary = pump.run(run).await;
            let _ = summary_tx.send(summary);
        });

        Ok(GenerationHandle {
            request_id,
            events: events_rx,
            summary: summary_rx,
            cancel,
        })
    }

    /// Applies a user edit through the document's edit gate.
    pub async fn edit_manually(&self, patch: ScenePatch) -> Result<u64, SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed(self.inner.id));
        }
        self.studio.apply_patch(self.inner.document, patch).await
    }

    /// Cancels the running generation, if any, and closes the session.
    pub fn close(&self) {
        self.studio.inner.sessions.remove(&self.inner.id);
        if self.inner.close() {
            info!(session_id = %self.inner.id, "session closed");
        }
    }

    fn reserve(&self, token: Option<&str>) -> Result<Uuid, SessionError> {
        let mut slot = self.inner.slot.lock();
        if let Some(token) = token
            && let Some(request_id) = slot.tokens.get(token)
        {
            return Err(SessionError::DuplicateRequest {
                request_id: *request_id,
            });
        }
        match &slot.state {
            SessionState::Closed => return Err(SessionError::Closed(self.inner.id)),
            SessionState::Generating { request_id, .. } => {
                return Err(SessionError::Busy {
                    request_id: *request_id,
                });
            }
            SessionState::Idle => {}
        }
        let request_id = Uuid::new_v4();
        if let Some(token) = token {
            slot.tokens.insert(token.to_string(), request_id);
        }
        slot.state = SessionState::Generating {
            request_id,
            attempt: 0,
            provider: None,
        };
        Ok(request_id)
    }

    async fn start_run(
        &self,
        request_id: Uuid,
        request: &GenerationRequest,
        snapshot: &DocumentSnapshot,
    ) -> Result<RunStream, SessionError> {
        let mut run = self
            .studio
            .inner
            .harness
            .run()
            .request_id(request_id)
            .system_prompt(SYSTEM_PROMPT)
            .input_parts(build_input(&request.prompt, Some(snapshot)))?;
        if let Some(deadline) = request.deadline {
            run = run.deadline(deadline);
        }
        if let Some(provider) = &request.preferred_provider {
            run = run.preferred_provider(provider.clone());
        }
        Ok(run.start_stream().await?)
    }
}

/// Moves one generation's events into the document.
struct Pump {
    store: SceneStore,
    gate: Arc<tokio::sync::Mutex<()>>,
    session: Arc<SessionInner>,
    document: DocumentId,
    request_id: Uuid,
    cancel: CancelHandle,
    events: mpsc::Sender<GenerationEvent>,
    translator: PatchTranslator,
    attempt: u32,
    /// Inverses of the current attempt's commits, oldest first.
    committed: Vec<Vec<ScenePatch>>,
    /// Nodes the current attempt inserted.
    created: HashSet<NodeId>,
    /// Attempt the harness gave up on; revoked once the next attempt starts.
    abandoned: Option<Abandoned>,
    revoked: u64,
    skipped: u64,
}

struct Abandoned {
    attempt: u32,
    provider: ProviderId,
    reason: ProviderError,
}

impl Pump {
    async fn run(mut self, mut run: RunStream) -> GenerationSummary {
        self.emit(GenerationEvent::Status(StatusPayload::Started {
            request_id: self.request_id,
            document_id: self.document,
        }))
        .await;

        let mut terminal = None;
        while let Some(event) = run.next_event().await {
            match event {
                FailoverEvent::AttemptStarted {
                    attempt, provider, ..
                } => {
                    if let Some(abandoned) = self.abandoned.take() {
                        self.revoke(abandoned).await;
                    }
                    self.start_attempt(attempt, provider).await;
                }
                FailoverEvent::Chunk { chunk, .. } => self.on_chunk(chunk).await,
                FailoverEvent::AttemptAbandoned {
                    attempt,
                    provider,
                    reason,
                    ..
                } => {
                    self.translator.reset();
                    debug!(request_id = %self.request_id, attempt, provider = %provider, error = %reason, "attempt abandoned");
                    self.abandoned = Some(Abandoned {
                        attempt,
                        provider,
                        reason,
                    });
                }
                FailoverEvent::Succeeded { output, .. } => {
                    terminal = Some(self.succeeded(output));
                    break;
                }
                FailoverEvent::Failed { failure, .. } => {
                    terminal = Some(self.failed(failure.code(), failure.to_string()));
                    break;
                }
            }
        }
        let status = terminal.unwrap_or_else(|| {
            self.failed("internal", "generation ended without a terminal event".into())
        });
        self.translator.finish();
        self.session.finish(self.request_id);
        self.emit(GenerationEvent::Status(status.clone())).await;

        GenerationSummary {
            request_id: self.request_id,
            status,
            attempts: self.attempt,
            revoked: self.revoked,
            skipped: self.skipped,
            translation: self.translator.stats(),
        }
    }

    async fn emit(&self, event: GenerationEvent) {
        if self.events.send(event).await.is_err() {
            debug!(request_id = %self.request_id, "generation handle dropped; event discarded");
        }
    }

    async fn start_attempt(&mut self, attempt: u32, provider: ProviderId) {
        self.translator.reset();
        self.committed.clear();
        self.created.clear();
        self.attempt = attempt;
        self.session
            .set_attempt(self.request_id, attempt, provider.clone());
        self.emit(GenerationEvent::Status(StatusPayload::Attempt {
            request_id: self.request_id,
            attempt,
            provider,
        }))
        .await;
    }

    async fn on_chunk(&mut self, chunk: StreamChunk) {
        if self.cancel.is_cancelled() || chunk.attempt != self.attempt {
            return;
        }
        let patches = self.translator.push_chunk(&chunk.text);
        self.emit(GenerationEvent::Chunk(ChunkPayload {
            request_id: self.request_id,
            provider: chunk.provider,
            attempt: chunk.attempt,
            seq: chunk.seq,
            text: chunk.text,
        }))
        .await;
        for patch in patches {
            if self.cancel.is_cancelled() {
                break;
            }
            self.commit(patch).await;
        }
    }

    async fn commit(&mut self, patch: ScenePatch) {
        let source = PatchSource::Ai {
            request_id: self.request_id,
            attempt: self.attempt,
        };
        let result = {
            let _guard = self.gate.lock().await;
            self.store.apply(self.document, patch.clone(), source)
        };
        match result {
            Ok(applied) => {
                if let ScenePatch::Insert { target, .. } = &patch {
                    self.created.insert(*target);
                }
                self.committed.push(applied.inverse);
                self.emit(GenerationEvent::Patch(PatchPayload {
                    revision: applied.revision,
                    source,
                    patch,
                }))
                .await;
            }
            Err(err) => {
                let code = match &err {
                    StoreError::Rejected(reason) => reason.code(),
                    _ => "internal",
                };
                warn!(request_id = %self.request_id, attempt = self.attempt, document_id = %self.document, code, error = %err, "generated patch rejected");
                self.emit(GenerationEvent::Error(ErrorPayload {
                    request_id: self.request_id,
                    attempt: self.attempt,
                    code: code.to_string(),
                    message: err.to_string(),
                }))
                .await;
            }
        }
    }

    /// Undoes the abandoned attempt's commits, newest first, under the gate.
    ///
    /// A delete that would take nodes the attempt did not insert with it is
    /// skipped, like any inverse that no longer applies.
    async fn revoke(&mut self, abandoned: Abandoned) {
        let Abandoned {
            attempt,
            provider,
            reason,
        } = abandoned;
        let source = PatchSource::Revocation {
            request_id: self.request_id,
            attempt,
        };
        let inverses = std::mem::take(&mut self.committed);
        let created = std::mem::take(&mut self.created);
        let mut applied_patches = Vec::new();
        let (mut revoked, mut skipped) = (0_u64, 0_u64);
        {
            let _guard = self.gate.lock().await;
            for patch in inverses.into_iter().rev().flatten() {
                if let ScenePatch::Delete { target } = &patch
                    && let Some(foreign) = self.foreign_descendant(*target, &created)
                {
                    skipped += 1;
                    debug!(request_id = %self.request_id, attempt, target = %target, node = %foreign, "subtree holds a node from outside the attempt; inverse skipped");
                    continue;
                }
                match self.store.apply(self.document, patch.clone(), source) {
                    Ok(applied) => {
                        revoked += 1;
                        applied_patches.push(PatchPayload {
                            revision: applied.revision,
                            source,
                            patch,
                        });
                    }
                    Err(err) => {
                        skipped += 1;
                        debug!(request_id = %self.request_id, attempt, error = %err, "inverse no longer applies");
                    }
                }
            }
        }
        self.revoked += revoked;
        self.skipped += skipped;
        info!(request_id = %self.request_id, attempt, provider = %provider, revoked, skipped, "abandoned attempt revoked");

        for payload in applied_patches {
            self.emit(GenerationEvent::Patch(payload)).await;
        }
        self.emit(GenerationEvent::Status(StatusPayload::AttemptRevoked {
            request_id: self.request_id,
            attempt,
            provider,
            reason: reason.to_string(),
            revoked,
            skipped,
        }))
        .await;
    }

    fn foreign_descendant(&self, target: NodeId, created: &HashSet<NodeId>) -> Option<NodeId> {
        self.store
            .with_document(self.document, |doc| {
                doc.tree()
                    .subtree_preorder(target)
                    .into_iter()
                    .find(|id| !created.contains(id))
            })
            .ok()
            .flatten()
    }

    fn revision(&self) -> u64 {
        self.store.revision(self.document).unwrap_or_default()
    }

    fn succeeded(&mut self, output: RunOutput) -> StatusPayload {
        if self.translator.finish() {
            warn!(request_id = %self.request_id, attempt = output.attempt, "output ended inside an unfinished unit");
        }
        StatusPayload::Succeeded {
            request_id: self.request_id,
            provider: output.provider,
            attempt: output.attempt,
            revision: self.revision(),
            committed: self.committed.len() as u64,
        }
    }

    fn failed(&self, code: &str, message: String) -> StatusPayload {
        warn!(request_id = %self.request_id, code, error = %message, "generation failed");
        StatusPayload::Failed {
            request_id: self.request_id,
            code: code.to_string(),
            message,
            revision: self.revision(),
            committed: self.committed.len() as u64,
            note: FORWARD_ONLY_NOTE.to_string(),
        }
    }
}
