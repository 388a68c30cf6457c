use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::document::{
    Applied, DocumentExport, DocumentId, DocumentSnapshot, LogEntry, ReplayError, SceneDocument,
};
use crate::node::NodeId;
use crate::patch::{PatchRejected, PatchSource, ScenePatch};

/// Default capacity of the change-notification channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Errors returned by [`SceneStore`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),
    #[error("document already exists: {0}")]
    DocumentExists(DocumentId),
    #[error("patch rejected: {0}")]
    Rejected(#[from] PatchRejected),
    #[error(transparent)]
    Replay(#[from] ReplayError),
}

/// Emitted after every successful apply so preview consumers can follow along.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChangeNotification {
    pub document_id: DocumentId,
    pub revision: u64,
    pub patch: ScenePatch,
}

struct StoreInner {
    documents: DashMap<DocumentId, Arc<Mutex<SceneDocument>>>,
    notifications: broadcast::Sender<ChangeNotification>,
}

/// Holds the canonical scene document of every open project.
///
/// Applies to one document are serialized by that document's lock; different
/// documents proceed independently. Apply never awaits.
#[derive(Clone)]
pub struct SceneStore {
    inner: Arc<StoreInner>,
}

impl Default for SceneStore {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}

impl SceneStore {
    /// Creates an empty store whose notification channel buffers `capacity`
    /// changes per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(StoreInner {
                documents: DashMap::new(),
                notifications,
            }),
        }
    }

    fn document(&self, id: DocumentId) -> Result<Arc<Mutex<SceneDocument>>, StoreError> {
        self.inner
            .documents
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::DocumentNotFound(id))
    }

    /// Creates an empty document (root container only) at revision 0.
    pub fn create_document(&self, title: impl Into<String>) -> DocumentId {
        let id = DocumentId::new();
        let doc = SceneDocument::new(id, title);
        info!(document_id = %id, title = doc.title(), "document created");
        self.inner.documents.insert(id, Arc::new(Mutex::new(doc)));
        id
    }

    /// Adds a previously exported document, verifying its log.
    pub fn import(&self, export: DocumentExport) -> Result<DocumentId, StoreError> {
        let id = export.id;
        if self.inner.documents.contains_key(&id) {
            return Err(StoreError::DocumentExists(id));
        }
        let doc = SceneDocument::import(export)?;
        info!(document_id = %id, revision = doc.revision(), "document imported");
        self.inner.documents.insert(id, Arc::new(Mutex::new(doc)));
        Ok(id)
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.inner.documents.contains_key(&id)
    }

    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.inner.documents.iter().map(|e| *e.key()).collect()
    }

    /// Drops a document and its history.
    pub fn remove(&self, id: DocumentId) -> bool {
        self.inner.documents.remove(&id).is_some()
    }

    /// Materialized document at its current revision.
    pub fn get(&self, id: DocumentId) -> Result<DocumentSnapshot, StoreError> {
        Ok(self.document(id)?.lock().snapshot())
    }

    pub fn revision(&self, id: DocumentId) -> Result<u64, StoreError> {
        Ok(self.document(id)?.lock().revision())
    }

    /// Runs `f` against the document under its lock.
    pub fn with_document<R>(
        &self,
        id: DocumentId,
        f: impl FnOnce(&SceneDocument) -> R,
    ) -> Result<R, StoreError> {
        let doc = self.document(id)?;
        let guard = doc.lock();
        Ok(f(&guard))
    }

    /// Applies `patch` atomically and notifies subscribers.
    pub fn apply(
        &self,
        id: DocumentId,
        patch: ScenePatch,
        source: PatchSource,
    ) -> Result<Applied, StoreError> {
        let doc = self.document(id)?;
        let applied = {
            let mut guard = doc.lock();
            let applied = guard.apply(patch.clone(), source)?;
            // Notify while still holding the lock so subscribers see revisions in order.
            let _ = self.inner.notifications.send(ChangeNotification {
                document_id: id,
                revision: applied.revision,
                patch,
            });
            applied
        };
        debug!(document_id = %id, revision = applied.revision, ?source, "patch applied");
        Ok(applied)
    }

    /// Reserves a node id that no other node of this document will ever get.
    pub fn allocate_node_id(&self, id: DocumentId) -> Result<NodeId, StoreError> {
        Ok(self.document(id)?.lock().allocate_node_id())
    }

    /// Log entries newer than `since`.
    pub fn history(&self, id: DocumentId, since: u64) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self.document(id)?.lock().history_since(since))
    }

    /// Explicitly bounds the retained log; see [`SceneDocument::truncate_history`].
    pub fn truncate_history(&self, id: DocumentId, keep_last: usize) -> Result<usize, StoreError> {
        let dropped = self.document(id)?.lock().truncate_history(keep_last)?;
        info!(document_id = %id, dropped, "history truncated");
        Ok(dropped)
    }

    pub fn export(&self, id: DocumentId) -> Result<DocumentExport, StoreError> {
        Ok(self.document(id)?.lock().export())
    }

    /// Replays the retained log and checks it reproduces the current tree.
    pub fn verify(&self, id: DocumentId) -> Result<bool, StoreError> {
        let doc = self.document(id)?;
        let guard = doc.lock();
        let replayed = guard.replay()?;
        Ok(replayed.same_nodes(guard.tree()))
    }

    /// Subscribes to change notifications for all documents.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.notifications.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, Props};
    use serde_json::json;

    fn insert(target: NodeId, parent: NodeId) -> ScenePatch {
        ScenePatch::Insert {
            target,
            parent,
            index: None,
            kind: NodeKind::Container,
            props: Props::new(),
        }
    }

    #[test]
    fn apply_increments_revision_and_checks_tree_every_time() {
        let store = SceneStore::default();
        let doc = store.create_document("landing");
        let mut parent = NodeId::ROOT;
        for expected in 1..=5 {
            let id = store.allocate_node_id(doc).expect("alloc");
            let applied = store
                .apply(doc, insert(id, parent), PatchSource::Manual)
                .expect("apply");
            assert_eq!(applied.revision, expected);
            store
                .with_document(doc, |d| d.tree().check())
                .expect("doc")
                .expect("tree invariant");
            parent = id;
        }
        assert!(store.verify(doc).expect("verify"));
    }

    #[test]
    fn unknown_document_is_reported() {
        let store = SceneStore::default();
        let missing = DocumentId::new();
        assert_eq!(
            store.get(missing).expect_err("missing"),
            StoreError::DocumentNotFound(missing)
        );
    }

    #[test]
    fn rejected_schema_patch_is_not_logged() {
        let store = SceneStore::default();
        let doc = store.create_document("landing");
        let id = store.allocate_node_id(doc).expect("alloc");
        let err = store
            .apply(
                doc,
                ScenePatch::Insert {
                    target: id,
                    parent: NodeId::ROOT,
                    index: None,
                    kind: NodeKind::Image,
                    props: json!({"alt": "no src"}).as_object().cloned().unwrap_or_default(),
                },
                PatchSource::Manual,
            )
            .expect_err("schema");
        assert!(matches!(err, StoreError::Rejected(PatchRejected::Schema { .. })));
        assert_eq!(store.revision(doc).expect("rev"), 0);
        assert!(store.history(doc, 0).expect("history").is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_notifications_in_revision_order() {
        let store = SceneStore::default();
        let doc = store.create_document("landing");
        let mut rx = store.subscribe();
        for _ in 0..3 {
            let id = store.allocate_node_id(doc).expect("alloc");
            store
                .apply(doc, insert(id, NodeId::ROOT), PatchSource::Manual)
                .expect("apply");
        }
        for expected in 1..=3 {
            let note = rx.recv().await.expect("notification");
            assert_eq!(note.document_id, doc);
            assert_eq!(note.revision, expected);
        }
    }

    #[test]
    fn documents_are_independent() {
        let store = SceneStore::default();
        let a = store.create_document("a");
        let b = store.create_document("b");
        let id = store.allocate_node_id(a).expect("alloc");
        store
            .apply(a, insert(id, NodeId::ROOT), PatchSource::Manual)
            .expect("apply");
        assert_eq!(store.revision(a).expect("a"), 1);
        assert_eq!(store.revision(b).expect("b"), 0);
    }

    #[test]
    fn import_refuses_duplicate_ids() {
        let store = SceneStore::default();
        let doc = store.create_document("a");
        let export = store.export(doc).expect("export");
        assert_eq!(
            store.import(export).expect_err("duplicate"),
            StoreError::DocumentExists(doc)
        );
    }
}
