//! Canonical scene documents for generated websites.
//!
//! A document is a tree of typed nodes addressed by stable ids. Every change,
//! whether typed by a user or streamed from a model, is a [`ScenePatch`]
//! applied atomically through [`SceneStore::apply`], which bumps the revision
//! and appends to a replayable log.
//!
//! ```
//! use orionix_scene::{NodeId, NodeKind, PatchSource, ScenePatch, SceneStore};
//!
//! let store = SceneStore::default();
//! let doc = store.create_document("landing page");
//! let id = store.allocate_node_id(doc)?;
//! let applied = store.apply(
//!     doc,
//!     ScenePatch::Insert {
//!         target: id,
//!         parent: NodeId::ROOT,
//!         index: None,
//!         kind: NodeKind::Container,
//!         props: Default::default(),
//!     },
//!     PatchSource::Manual,
//! )?;
//! assert_eq!(applied.revision, 1);
//! # Ok::<(), orionix_scene::StoreError>(())
//! ```

/// Revisioned documents, log entries and export/import.
pub mod document;
/// Node ids, kinds and materialized views.
pub mod node;
/// Patch operations, sources and rejection reasons.
pub mod patch;
/// Per-kind property schemas.
pub mod schema;
/// Concurrent multi-document store with change notifications.
pub mod store;
/// Streaming model output to patch translation.
pub mod translate;
/// The node tree and its apply rules.
pub mod tree;

pub use document::{
    Applied, DocumentExport, DocumentId, DocumentSnapshot, LogEntry, ReplayError, SceneDocument,
};
pub use node::{InvalidNodeId, MaterializedNode, NodeId, NodeKind, Props, SceneNode};
pub use patch::{PatchOp, PatchRejected, PatchSource, ScenePatch};
pub use schema::{SchemaViolation, validate_props};
pub use store::{ChangeNotification, DEFAULT_NOTIFICATION_CAPACITY, SceneStore, StoreError};
pub use translate::{
    DocumentIdSource, NodeIdSource, ObjectScanner, PatchTranslator, TranslationStats, UnitError,
};
pub use tree::{SceneTree, TreeViolation};
