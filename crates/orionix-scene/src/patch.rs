use std::fmt;

use crate::node::{NodeId, NodeKind, Props};
use crate::schema::SchemaViolation;

/// Atomic structural mutation of a scene document.
///
/// Nodes are addressed by stable id, never by child index. AI-generated and
/// user-issued patches share this type and the same apply path.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ScenePatch {
    /// Creates `target` under `parent` at `index` (append when absent or out of range).
    Insert {
        target: NodeId,
        parent: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        kind: NodeKind,
        #[serde(default)]
        props: Props,
    },
    /// Merges `props` into the node's bag; a `null` value removes the key.
    Update { target: NodeId, props: Props },
    /// Removes `target` and its whole subtree.
    Delete { target: NodeId },
    /// Re-parents `target` under `parent` at `index`.
    Move {
        target: NodeId,
        parent: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
}

impl ScenePatch {
    /// Node addressed by the patch.
    pub fn target(&self) -> NodeId {
        match self {
            ScenePatch::Insert { target, .. }
            | ScenePatch::Update { target, .. }
            | ScenePatch::Delete { target }
            | ScenePatch::Move { target, .. } => *target,
        }
    }

    /// Operation tag of the patch.
    pub fn op(&self) -> PatchOp {
        match self {
            ScenePatch::Insert { .. } => PatchOp::Insert,
            ScenePatch::Update { .. } => PatchOp::Update,
            ScenePatch::Delete { .. } => PatchOp::Delete,
            ScenePatch::Move { .. } => PatchOp::Move,
        }
    }
}

/// Operation tag of a [`ScenePatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Insert,
    Update,
    Delete,
    Move,
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatchOp::Insert => "insert",
            PatchOp::Update => "update",
            PatchOp::Delete => "delete",
            PatchOp::Move => "move",
        })
    }
}

/// Origin of a committed patch, recorded in the revision log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PatchSource {
    /// Direct user edit.
    Manual,
    /// Produced by the translator for one provider attempt of a generation request.
    Ai { request_id: uuid::Uuid, attempt: u32 },
    /// Compensating patch that revokes an abandoned attempt's work.
    Revocation { request_id: uuid::Uuid, attempt: u32 },
}

impl PatchSource {
    /// Revocations may restore nodes under their original (retired) ids.
    pub(crate) fn may_restore(&self) -> bool {
        matches!(self, PatchSource::Revocation { .. })
    }
}

/// Reason a patch was not applied. The document is unchanged in every case.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchRejected {
    #[error("node {0} does not exist")]
    NodeNotFound(NodeId),
    #[error("parent node {0} does not exist")]
    ParentNotFound(NodeId),
    #[error("node id {0} is outside the allocatable range")]
    IdOutOfRange(NodeId),
    #[error("node id {0} is already in use")]
    DuplicateId(NodeId),
    #[error("node id {0} was retired and cannot be reused")]
    RetiredId(NodeId),
    #[error("{kind} node {parent} cannot hold children")]
    LeafParent { parent: NodeId, kind: NodeKind },
    #[error("moving {target} under {parent} would create a cycle")]
    Cycle { target: NodeId, parent: NodeId },
    #[error("the root node cannot be the target of {0}")]
    RootImmutable(PatchOp),
    #[error("invalid properties for {target}: {violation}")]
    Schema {
        target: NodeId,
        #[source]
        violation: SchemaViolation,
    },
}

impl PatchRejected {
    /// Stable, classifiable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            PatchRejected::NodeNotFound(_) => "node_not_found",
            PatchRejected::ParentNotFound(_) => "parent_not_found",
            PatchRejected::IdOutOfRange(_) => "id_out_of_range",
            PatchRejected::DuplicateId(_) => "duplicate_id",
            PatchRejected::RetiredId(_) => "retired_id",
            PatchRejected::LeafParent { .. } => "leaf_parent",
            PatchRejected::Cycle { .. } => "cycle",
            PatchRejected::RootImmutable(_) => "root_immutable",
            PatchRejected::Schema { .. } => "schema_violation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_wire_shape_is_tagged_by_op() {
        let patch: ScenePatch = serde_json::from_value(json!({
            "op": "move",
            "target": "n3",
            "parent": "n1"
        }))
        .expect("parse move");
        assert_eq!(
            patch,
            ScenePatch::Move {
                target: NodeId::new(3),
                parent: NodeId::new(1),
                index: None
            }
        );
        assert_eq!(patch.op(), PatchOp::Move);
        assert_eq!(patch.target(), NodeId::new(3));
    }

    #[test]
    fn sources_serialize_with_tag() {
        let value = serde_json::to_value(PatchSource::Manual).expect("serialize");
        assert_eq!(value, json!({"source": "manual"}));
    }
}
