//! Node arena with parent/child indices.
//!
//! `apply` validates a patch completely before touching the arena, so a
//! rejected patch leaves the tree exactly as it was.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::node::{MaterializedNode, NodeId, NodeKind, Props, SceneNode};
use crate::patch::{PatchOp, PatchRejected, PatchSource, ScenePatch};
use crate::schema::validate_props;

/// Structural invariant violation found by [`SceneTree::check`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeViolation {
    #[error("root node is missing or has a parent")]
    BadRoot,
    #[error("node {node} points at missing parent {parent}")]
    MissingParent { node: NodeId, parent: NodeId },
    #[error("node {node} is not listed exactly once by its parent {parent}")]
    ChildListMismatch { node: NodeId, parent: NodeId },
    #[error("node {parent} lists child {child} whose parent pointer disagrees")]
    ParentPointerMismatch { parent: NodeId, child: NodeId },
    #[error("{0} node(s) are unreachable from the root")]
    Unreachable(usize),
    #[error("arena slot {key} holds node {node}")]
    KeyMismatch { key: NodeId, node: NodeId },
    #[error("node id {id} is not below the next allocatable id {next_id}")]
    AllocatorBehind { id: NodeId, next_id: u64 },
    #[error("node id {0} is both live and retired")]
    RetiredLive(NodeId),
}

/// Arena of scene nodes keyed by id.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SceneTree {
    nodes: BTreeMap<NodeId, SceneNode>,
    #[serde(default)]
    retired: BTreeSet<NodeId>,
    next_id: u64,
}

impl Default for SceneTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneTree {
    /// Creates a tree holding only the root container.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(NodeId::ROOT, SceneNode::root());
        Self {
            nodes,
            retired: BTreeSet::new(),
            next_id: 1,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&SceneNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// All live nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &SceneNode> {
        self.nodes.values()
    }

    /// Returns true when both trees hold identical live nodes.
    pub fn same_nodes(&self, other: &SceneTree) -> bool {
        self.nodes == other.nodes
    }

    /// Hands out a fresh id. The id is burned even if no insert ever uses it.
    pub fn allocate_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    /// Returns true when `ancestor` is `node` or lies on its parent chain.
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// Applies one patch and returns the patches that undo it, in apply order.
    pub(crate) fn apply(
        &mut self,
        patch: &ScenePatch,
        source: PatchSource,
    ) -> Result<Vec<ScenePatch>, PatchRejected> {
        match patch {
            ScenePatch::Insert {
                target,
                parent,
                index,
                kind,
                props,
            } => self.insert(*target, *parent, *index, *kind, props, source),
            ScenePatch::Update { target, props } => self.update(*target, props),
            ScenePatch::Delete { target } => self.delete(*target),
            ScenePatch::Move {
                target,
                parent,
                index,
            } => self.move_node(*target, *parent, *index),
        }
    }

    fn container(&self, parent: NodeId) -> Result<&SceneNode, PatchRejected> {
        let node = self
            .nodes
            .get(&parent)
            .ok_or(PatchRejected::ParentNotFound(parent))?;
        if !node.kind.can_have_children() {
            return Err(PatchRejected::LeafParent {
                parent,
                kind: node.kind,
            });
        }
        Ok(node)
    }

    fn insert(
        &mut self,
        target: NodeId,
        parent: NodeId,
        index: Option<usize>,
        kind: NodeKind,
        props: &Props,
        source: PatchSource,
    ) -> Result<Vec<ScenePatch>, PatchRejected> {
        if self.nodes.contains_key(&target) {
            return Err(PatchRejected::DuplicateId(target));
        }
        if self.retired.contains(&target) && !source.may_restore() {
            return Err(PatchRejected::RetiredId(target));
        }
        let next_id = target
            .get()
            .checked_add(1)
            .ok_or(PatchRejected::IdOutOfRange(target))?
            .max(self.next_id);
        self.container(parent)?;
        validate_props(kind, props)
            .map_err(|violation| PatchRejected::Schema { target, violation })?;

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            let at = clamp_index(index, parent_node.children.len());
            parent_node.children.insert(at, target);
        }
        self.nodes.insert(
            target,
            SceneNode {
                id: target,
                kind,
                parent: Some(parent),
                children: Vec::new(),
                props: props.clone(),
            },
        );
        self.retired.remove(&target);
        self.next_id = next_id;
        Ok(vec![ScenePatch::Delete { target }])
    }

    fn update(&mut self, target: NodeId, changes: &Props) -> Result<Vec<ScenePatch>, PatchRejected> {
        let node = self
            .nodes
            .get(&target)
            .ok_or(PatchRejected::NodeNotFound(target))?;
        let mut merged = node.props.clone();
        let mut previous = Props::new();
        for (key, value) in changes {
            let old = if value.is_null() {
                merged.remove(key)
            } else {
                merged.insert(key.clone(), value.clone())
            };
            previous.insert(key.clone(), old.unwrap_or(serde_json::Value::Null));
        }
        validate_props(node.kind, &merged)
            .map_err(|violation| PatchRejected::Schema { target, violation })?;

        if let Some(node) = self.nodes.get_mut(&target) {
            node.props = merged;
        }
        Ok(vec![ScenePatch::Update {
            target,
            props: previous,
        }])
    }

    fn delete(&mut self, target: NodeId) -> Result<Vec<ScenePatch>, PatchRejected> {
        if target.is_root() {
            return Err(PatchRejected::RootImmutable(PatchOp::Delete));
        }
        if !self.nodes.contains_key(&target) {
            return Err(PatchRejected::NodeNotFound(target));
        }

        let subtree = self.subtree_preorder(target);
        let mut inverse = Vec::with_capacity(subtree.len());
        for id in &subtree {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let Some(parent) = node.parent else {
                continue;
            };
            let index = self
                .nodes
                .get(&parent)
                .and_then(|p| p.children.iter().position(|c| c == id));
            inverse.push(ScenePatch::Insert {
                target: *id,
                parent,
                index,
                kind: node.kind,
                props: node.props.clone(),
            });
        }

        let parent = self.nodes.get(&target).and_then(|n| n.parent);
        if let Some(parent_node) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent_node.children.retain(|c| *c != target);
        }
        for id in subtree {
            self.nodes.remove(&id);
            self.retired.insert(id);
        }
        Ok(inverse)
    }

    fn move_node(
        &mut self,
        target: NodeId,
        new_parent: NodeId,
        index: Option<usize>,
    ) -> Result<Vec<ScenePatch>, PatchRejected> {
        if target.is_root() {
            return Err(PatchRejected::RootImmutable(PatchOp::Move));
        }
        let node = self
            .nodes
            .get(&target)
            .ok_or(PatchRejected::NodeNotFound(target))?;
        let old_parent = node.parent.ok_or(PatchRejected::RootImmutable(PatchOp::Move))?;
        self.container(new_parent)?;
        if self.is_ancestor_or_self(target, new_parent) {
            return Err(PatchRejected::Cycle {
                target,
                parent: new_parent,
            });
        }
        let old_index = self
            .nodes
            .get(&old_parent)
            .and_then(|p| p.children.iter().position(|c| *c == target));

        if let Some(parent_node) = self.nodes.get_mut(&old_parent) {
            parent_node.children.retain(|c| *c != target);
        }
        if let Some(parent_node) = self.nodes.get_mut(&new_parent) {
            let at = clamp_index(index, parent_node.children.len());
            parent_node.children.insert(at, target);
        }
        if let Some(node) = self.nodes.get_mut(&target) {
            node.parent = Some(new_parent);
        }
        Ok(vec![ScenePatch::Move {
            target,
            parent: old_parent,
            index: old_index,
        }])
    }

    /// Ids of `root` and all its descendants, parents before children.
    pub fn subtree_preorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        order
    }

    /// Verifies the tree invariants: single root, consistent parent and child
    /// indices, every node reachable from the root. Every live or retired id
    /// must also sit below the allocator so fresh ids never collide.
    pub fn check(&self) -> Result<(), TreeViolation> {
        match self.nodes.get(&NodeId::ROOT) {
            Some(root) if root.parent.is_none() => {}
            _ => return Err(TreeViolation::BadRoot),
        }
        for id in &self.retired {
            if self.nodes.contains_key(id) {
                return Err(TreeViolation::RetiredLive(*id));
            }
        }
        for id in self.nodes.keys().chain(&self.retired) {
            if id.get() >= self.next_id {
                return Err(TreeViolation::AllocatorBehind {
                    id: *id,
                    next_id: self.next_id,
                });
            }
        }
        for (key, node) in &self.nodes {
            if *key != node.id {
                return Err(TreeViolation::KeyMismatch {
                    key: *key,
                    node: node.id,
                });
            }
        }
        for node in self.nodes.values() {
            if let Some(parent) = node.parent {
                let parent_node =
                    self.nodes
                        .get(&parent)
                        .ok_or(TreeViolation::MissingParent {
                            node: node.id,
                            parent,
                        })?;
                let listed = parent_node.children.iter().filter(|c| **c == node.id).count();
                if listed != 1 {
                    return Err(TreeViolation::ChildListMismatch {
                        node: node.id,
                        parent,
                    });
                }
            } else if !node.id.is_root() {
                return Err(TreeViolation::BadRoot);
            }
            for child in &node.children {
                let points_back = self
                    .nodes
                    .get(child)
                    .is_some_and(|c| c.parent == Some(node.id));
                if !points_back {
                    return Err(TreeViolation::ParentPointerMismatch {
                        parent: node.id,
                        child: *child,
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        let mut stack = vec![NodeId::ROOT];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().copied());
            }
        }
        let unreachable = self.nodes.len() - seen.len();
        if unreachable > 0 {
            return Err(TreeViolation::Unreachable(unreachable));
        }
        Ok(())
    }

    /// Builds the nested view rooted at the document root.
    pub fn materialize(&self) -> MaterializedNode {
        self.materialize_from(NodeId::ROOT)
            .unwrap_or_else(|| MaterializedNode {
                id: NodeId::ROOT,
                kind: NodeKind::Container,
                props: Props::new(),
                children: Vec::new(),
            })
    }

    fn materialize_from(&self, id: NodeId) -> Option<MaterializedNode> {
        let node = self.nodes.get(&id)?;
        Some(MaterializedNode {
            id,
            kind: node.kind,
            props: node.props.clone(),
            children: node
                .children
                .iter()
                .filter_map(|c| self.materialize_from(*c))
                .collect(),
        })
    }
}

fn clamp_index(index: Option<usize>, len: usize) -> usize {
    index.map_or(len, |i| i.min(len))
}
