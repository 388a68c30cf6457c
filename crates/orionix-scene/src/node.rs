use std::fmt;
use std::str::FromStr;

/// Property bag carried by every scene node.
pub type Props = serde_json::Map<String, serde_json::Value>;

/// Stable identifier of a scene node.
///
/// Ids are allocated per document, render as `n<integer>` and are never
/// reassigned to a different node. The root is always `n0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Id of the document root.
    pub const ROOT: NodeId = NodeId(0);

    /// Creates a node id from its numeric value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value of the id.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true for the document root.
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Error returned when a string is not a valid `n<integer>` node id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id: {0:?}")]
pub struct InvalidNodeId(pub String);

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('n')
            .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| InvalidNodeId(s.to_string()))?;
        digits
            .parse::<u64>()
            .map(NodeId)
            .map_err(|_| InvalidNodeId(s.to_string()))
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Element type of a scene node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Layout group; the root is a container.
    Container,
    /// Text block.
    Text,
    /// Raster image.
    Image,
    /// Video element.
    Video,
    /// 2D primitive (rectangle, circle, ...).
    Shape,
    /// 3D primitive; may group child nodes.
    Mesh,
    /// Scene light.
    Light,
}

impl NodeKind {
    /// Whether nodes of this kind may own children.
    pub const fn can_have_children(self) -> bool {
        matches!(self, NodeKind::Container | NodeKind::Mesh)
    }

    /// Lowercase name used on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            NodeKind::Container => "container",
            NodeKind::Text => "text",
            NodeKind::Image => "image",
            NodeKind::Video => "video",
            NodeKind::Shape => "shape",
            NodeKind::Mesh => "mesh",
            NodeKind::Light => "light",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of the scene tree as stored in the node arena.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SceneNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// `None` only for the root.
    pub parent: Option<NodeId>,
    /// Ordered child ids.
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub props: Props,
}

impl SceneNode {
    pub(crate) fn root() -> Self {
        Self {
            id: NodeId::ROOT,
            kind: NodeKind::Container,
            parent: None,
            children: Vec::new(),
            props: Props::new(),
        }
    }
}

/// Nested, render-ready view of a node and its subtree.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MaterializedNode {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Props::is_empty")]
    pub props: Props,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MaterializedNode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_through_display() {
        let id: NodeId = "n42".parse().expect("parse");
        assert_eq!(id, NodeId::new(42));
        assert_eq!(id.to_string(), "n42");
    }

    #[test]
    fn node_id_rejects_keys_and_signs() {
        for raw in ["hero", "n", "n-1", "42", "n4x", ""] {
            assert!(raw.parse::<NodeId>().is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn node_id_serializes_as_string() {
        let value = serde_json::to_value(NodeId::new(7)).expect("serialize");
        assert_eq!(value, serde_json::json!("n7"));
        let back: NodeId = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, NodeId::new(7));
    }

    #[test]
    fn only_containers_and_meshes_hold_children() {
        assert!(NodeKind::Container.can_have_children());
        assert!(NodeKind::Mesh.can_have_children());
        assert!(!NodeKind::Text.can_have_children());
        assert!(!NodeKind::Light.can_have_children());
    }
}
