use std::fmt;

use crate::node::{MaterializedNode, NodeId};
use crate::patch::{PatchRejected, PatchSource, ScenePatch};
use crate::tree::{SceneTree, TreeViolation};

/// Identifier of a scene document (one per project).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DocumentId(pub uuid::Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// One committed transition of the revision log.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Revision produced by this patch.
    pub revision: u64,
    #[serde(flatten)]
    pub source: PatchSource,
    pub patch: ScenePatch,
}

/// Result of a successful apply.
#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    /// Revision after the patch.
    pub revision: u64,
    /// Patches that undo this transition, in apply order.
    pub inverse: Vec<ScenePatch>,
}

/// Errors raised while rebuilding a document from its log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("log entry for revision {revision} does not apply: {reason}")]
    Rejected {
        revision: u64,
        #[source]
        reason: PatchRejected,
    },
    #[error("log is not contiguous: expected revision {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
    #[error("replayed tree violates invariants: {0}")]
    Corrupt(#[from] TreeViolation),
}

/// Render-ready view of a document at its current revision.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub title: String,
    pub revision: u64,
    pub root: MaterializedNode,
}

/// Serializable form of a document: base snapshot plus the retained log.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DocumentExport {
    pub id: DocumentId,
    pub title: String,
    pub base_revision: u64,
    pub base: SceneTree,
    pub log: Vec<LogEntry>,
}

/// Canonical scene graph of one project with its revision history.
///
/// The tree is only ever changed through [`SceneDocument::apply`]; `base` and
/// `log` always replay to `tree`.
#[derive(Clone, Debug)]
pub struct SceneDocument {
    id: DocumentId,
    title: String,
    tree: SceneTree,
    revision: u64,
    base: SceneTree,
    base_revision: u64,
    log: Vec<LogEntry>,
}

impl SceneDocument {
    pub fn new(id: DocumentId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            tree: SceneTree::new(),
            revision: 0,
            base: SceneTree::new(),
            base_revision: 0,
            log: Vec::new(),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn tree(&self) -> &SceneTree {
        &self.tree
    }

    /// Retained log entries, oldest first.
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Revision the retained log starts after.
    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    pub fn allocate_node_id(&mut self) -> NodeId {
        self.tree.allocate_id()
    }

    /// Applies a patch atomically. On success the revision grows by exactly one
    /// and the patch is appended to the log.
    pub fn apply(&mut self, patch: ScenePatch, source: PatchSource) -> Result<Applied, PatchRejected> {
        let inverse = self.tree.apply(&patch, source)?;
        self.revision += 1;
        self.log.push(LogEntry {
            revision: self.revision,
            source,
            patch,
        });
        debug_assert!(self.tree.check().is_ok(), "apply broke tree invariants");
        Ok(Applied {
            revision: self.revision,
            inverse,
        })
    }

    /// Log entries with a revision greater than `since`.
    pub fn history_since(&self, since: u64) -> Vec<LogEntry> {
        self.log
            .iter()
            .filter(|entry| entry.revision > since)
            .cloned()
            .collect()
    }

    /// Folds all but the newest `keep_last` log entries into the base snapshot.
    /// Revisions keep their numbers. Returns how many entries were dropped.
    pub fn truncate_history(&mut self, keep_last: usize) -> Result<usize, ReplayError> {
        let drop = self.log.len().saturating_sub(keep_last);
        if drop == 0 {
            return Ok(0);
        }
        let mut base = self.base.clone();
        for entry in &self.log[..drop] {
            base.apply(&entry.patch, entry.source)
                .map_err(|reason| ReplayError::Rejected {
                    revision: entry.revision,
                    reason,
                })?;
        }
        self.base = base;
        self.base_revision = self.log[drop - 1].revision;
        self.log.drain(..drop);
        Ok(drop)
    }

    /// Rebuilds the tree from the base snapshot and the retained log.
    pub fn replay(&self) -> Result<SceneTree, ReplayError> {
        replay_log(&self.base, self.base_revision, &self.log)
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            id: self.id,
            title: self.title.clone(),
            revision: self.revision,
            root: self.tree.materialize(),
        }
    }

    pub fn export(&self) -> DocumentExport {
        DocumentExport {
            id: self.id,
            title: self.title.clone(),
            base_revision: self.base_revision,
            base: self.base.clone(),
            log: self.log.clone(),
        }
    }

    /// Reconstructs a document from an export, verifying the log as it goes.
    pub fn import(export: DocumentExport) -> Result<Self, ReplayError> {
        export.base.check()?;
        let tree = replay_log(&export.base, export.base_revision, &export.log)?;
        let revision = export.base_revision + export.log.len() as u64;
        Ok(Self {
            id: export.id,
            title: export.title,
            tree,
            revision,
            base: export.base,
            base_revision: export.base_revision,
            log: export.log,
        })
    }
}

fn replay_log(base: &SceneTree, base_revision: u64, log: &[LogEntry]) -> Result<SceneTree, ReplayError> {
    let mut tree = base.clone();
    let mut expected = base_revision + 1;
    for entry in log {
        if entry.revision != expected {
            return Err(ReplayError::Gap {
                expected,
                found: entry.revision,
            });
        }
        tree.apply(&entry.patch, entry.source)
            .map_err(|reason| ReplayError::Rejected {
                revision: entry.revision,
                reason,
            })?;
        tree.check()?;
        expected += 1;
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, Props};
    use serde_json::json;

    fn text(target: u64, parent: u64, content: &str) -> ScenePatch {
        ScenePatch::Insert {
            target: NodeId::new(target),
            parent: NodeId::new(parent),
            index: None,
            kind: NodeKind::Text,
            props: json!({ "content": content }).as_object().cloned().unwrap_or_default(),
        }
    }

    fn container(target: u64, parent: u64) -> ScenePatch {
        ScenePatch::Insert {
            target: NodeId::new(target),
            parent: NodeId::new(parent),
            index: None,
            kind: NodeKind::Container,
            props: Props::new(),
        }
    }

    #[test]
    fn rejected_patch_leaves_revision_and_tree_unchanged() {
        let mut doc = SceneDocument::new(DocumentId::new(), "site");
        doc.apply(container(1, 0), PatchSource::Manual).expect("insert");
        let before = doc.tree().clone();

        let err = doc
            .apply(
                ScenePatch::Update {
                    target: NodeId::new(99),
                    props: Props::new(),
                },
                PatchSource::Manual,
            )
            .expect_err("missing node");
        assert_eq!(err, PatchRejected::NodeNotFound(NodeId::new(99)));
        assert_eq!(doc.revision(), 1);
        assert_eq!(doc.log().len(), 1);
        assert!(doc.tree().same_nodes(&before));
    }

    #[test]
    fn noop_move_still_increments_revision() {
        let mut doc = SceneDocument::new(DocumentId::new(), "site");
        doc.apply(container(1, 0), PatchSource::Manual).expect("insert");
        let applied = doc
            .apply(
                ScenePatch::Move {
                    target: NodeId::new(1),
                    parent: NodeId::ROOT,
                    index: Some(0),
                },
                PatchSource::Manual,
            )
            .expect("no-op move");
        assert_eq!(applied.revision, 2);
    }

    #[test]
    fn truncation_keeps_replay_equal_to_tree() {
        let mut doc = SceneDocument::new(DocumentId::new(), "site");
        doc.apply(container(1, 0), PatchSource::Manual).expect("a");
        doc.apply(text(2, 1, "one"), PatchSource::Manual).expect("b");
        doc.apply(text(3, 1, "two"), PatchSource::Manual).expect("c");
        doc.apply(ScenePatch::Delete { target: NodeId::new(2) }, PatchSource::Manual)
            .expect("d");

        assert_eq!(doc.truncate_history(1).expect("truncate"), 3);
        assert_eq!(doc.base_revision(), 3);
        assert_eq!(doc.revision(), 4);
        assert_eq!(doc.log()[0].revision, 4);
        assert!(doc.replay().expect("replay").same_nodes(doc.tree()));
    }

    #[test]
    fn export_import_round_trip_preserves_revision() {
        let mut doc = SceneDocument::new(DocumentId::new(), "portfolio");
        doc.apply(container(1, 0), PatchSource::Manual).expect("a");
        doc.apply(text(2, 1, "hi"), PatchSource::Manual).expect("b");
        let json = serde_json::to_string(&doc.export()).expect("serialize");
        let export: DocumentExport = serde_json::from_str(&json).expect("deserialize");
        let restored = SceneDocument::import(export).expect("import");
        assert_eq!(restored.revision(), 2);
        assert_eq!(restored.snapshot(), doc.snapshot());
    }

    #[test]
    fn import_rejects_an_allocator_behind_live_ids() {
        let mut doc = SceneDocument::new(DocumentId::new(), "site");
        doc.apply(container(1, 0), PatchSource::Manual).expect("a");
        doc.apply(text(2, 1, "hi"), PatchSource::Manual).expect("b");
        doc.truncate_history(0).expect("truncate");
        let mut raw = serde_json::to_value(doc.export()).expect("serialize");
        raw["base"]["next_id"] = json!(1);
        let export: DocumentExport = serde_json::from_value(raw).expect("deserialize");
        assert!(matches!(
            SceneDocument::import(export),
            Err(ReplayError::Corrupt(TreeViolation::AllocatorBehind { next_id: 1, .. }))
        ));
    }

    #[test]
    fn import_rejects_nodes_filed_under_another_id() {
        let mut doc = SceneDocument::new(DocumentId::new(), "site");
        doc.apply(container(1, 0), PatchSource::Manual).expect("a");
        doc.truncate_history(0).expect("truncate");
        let mut raw = serde_json::to_value(doc.export()).expect("serialize");
        raw["base"]["nodes"]["n1"]["id"] = json!("n0");
        let export: DocumentExport = serde_json::from_value(raw).expect("deserialize");
        assert!(matches!(
            SceneDocument::import(export),
            Err(ReplayError::Corrupt(TreeViolation::KeyMismatch { .. }))
        ));
    }

    #[test]
    fn import_rejects_gaps_in_the_log() {
        let mut doc = SceneDocument::new(DocumentId::new(), "site");
        doc.apply(container(1, 0), PatchSource::Manual).expect("a");
        doc.apply(text(2, 1, "hi"), PatchSource::Manual).expect("b");
        let mut export = doc.export();
        export.log.remove(0);
        assert!(matches!(
            SceneDocument::import(export),
            Err(ReplayError::Gap { expected: 1, found: 2 })
        ));
    }
}
