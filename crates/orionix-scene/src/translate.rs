//! Streaming translation of raw model output into scene patches.
//!
//! Model output is free text containing one JSON object per scene operation.
//! [`ObjectScanner`] cuts complete top-level objects out of the stream as they
//! close; [`PatchTranslator`] turns each into a [`ScenePatch`] with resolved
//! node ids. Incomplete objects stay buffered and are never emitted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::document::DocumentId;
use crate::node::{NodeId, NodeKind, Props};
use crate::patch::ScenePatch;
use crate::schema::validate_props;
use crate::store::{SceneStore, StoreError};

/// Source of fresh node ids for inserts produced by the translator.
pub trait NodeIdSource: Send + Sync {
    fn next_node_id(&self) -> Result<NodeId, StoreError>;
}

/// Allocates ids from one document of a [`SceneStore`].
pub struct DocumentIdSource {
    store: SceneStore,
    document: DocumentId,
}

impl DocumentIdSource {
    pub fn new(store: SceneStore, document: DocumentId) -> Self {
        Self { store, document }
    }
}

impl NodeIdSource for DocumentIdSource {
    fn next_node_id(&self) -> Result<NodeId, StoreError> {
        self.store.allocate_node_id(self.document)
    }
}

/// Incremental scanner for brace-delimited JSON objects embedded in text.
///
/// Braces inside JSON strings (including escaped quotes) do not count. Text
/// outside objects is skipped.
#[derive(Default, Debug)]
pub struct ObjectScanner {
    buf: String,
    /// Byte offset where scanning resumes.
    pos: usize,
    /// Byte offset of the `{` that opened the current object.
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl ObjectScanner {
    /// Feeds text and returns every object completed by it, in order.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut objects = Vec::new();
        for (offset, ch) in self.buf[self.pos..].char_indices() {
            let at = self.pos + offset;
            match self.start {
                None => {
                    if ch == '{' {
                        self.start = Some(at);
                        self.depth = 1;
                    }
                }
                Some(start) => {
                    if self.in_string {
                        if self.escaped {
                            self.escaped = false;
                        } else if ch == '\\' {
                            self.escaped = true;
                        } else if ch == '"' {
                            self.in_string = false;
                        }
                        continue;
                    }
                    match ch {
                        '"' => self.in_string = true,
                        '{' => self.depth += 1,
                        '}' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                objects.push(self.buf[start..=at].to_string());
                                self.start = None;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        // Keep only the open object, if any.
        let consumed = self.start.unwrap_or(self.buf.len());
        self.buf.drain(..consumed);
        self.start = self.start.map(|s| s - consumed);
        self.pos = self.buf.len();
        objects
    }

    /// Returns true when an object has started but not closed.
    pub fn has_partial(&self) -> bool {
        self.start.is_some()
    }

    /// Discards any buffered partial object.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// One scene operation as written by the model, before id resolution.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", deny_unknown_fields)]
enum SceneOp {
    Insert {
        #[serde(default)]
        key: Option<String>,
        parent: String,
        #[serde(default)]
        index: Option<usize>,
        kind: NodeKind,
        #[serde(default)]
        props: Props,
    },
    Update {
        target: String,
        props: Props,
    },
    Delete {
        target: String,
    },
    Move {
        target: String,
        parent: String,
        #[serde(default)]
        index: Option<usize>,
    },
}

/// Why a complete unit was dropped instead of emitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("unit is not a valid scene operation: {0}")]
    Malformed(String),
    #[error("unknown node reference `{0}`")]
    UnknownReference(String),
    #[error("key `{0}` was already used in this attempt")]
    DuplicateKey(String),
    #[error("insert has invalid properties: {0}")]
    InvalidProps(String),
    #[error("could not allocate a node id: {0}")]
    Allocation(String),
}

/// Counters describing one translation run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct TranslationStats {
    pub emitted: u64,
    pub dropped: u64,
    pub discarded_partials: u64,
}

/// Converts one attempt's chunk sequence into scene patches.
///
/// Keys introduced by inserts are scoped to the current attempt; [`reset`]
/// forgets them together with any buffered partial unit.
///
/// [`reset`]: PatchTranslator::reset
pub struct PatchTranslator {
    scanner: ObjectScanner,
    keys: HashMap<String, NodeId>,
    ids: Arc<dyn NodeIdSource>,
    stats: TranslationStats,
}

impl PatchTranslator {
    pub fn new(ids: Arc<dyn NodeIdSource>) -> Self {
        Self {
            scanner: ObjectScanner::default(),
            keys: HashMap::new(),
            ids,
            stats: TranslationStats::default(),
        }
    }

    /// Feeds one chunk and returns the patches completed by it, in order.
    pub fn push_chunk(&mut self, text: &str) -> Vec<ScenePatch> {
        let mut patches = Vec::new();
        for unit in self.scanner.push(text) {
            match self.translate_unit(&unit) {
                Ok(patch) => {
                    self.stats.emitted += 1;
                    debug!(op = %patch.op(), target = %patch.target(), "unit translated");
                    patches.push(patch);
                }
                Err(err) => {
                    self.stats.dropped += 1;
                    warn!(error = %err, "dropping scene unit");
                }
            }
        }
        patches
    }

    /// Ends the current chunk sequence, discarding an unfinished unit.
    /// Returns true when something was discarded.
    pub fn finish(&mut self) -> bool {
        let partial = self.scanner.has_partial();
        if partial {
            self.stats.discarded_partials += 1;
            debug!("discarding incomplete scene unit");
        }
        self.scanner.clear();
        partial
    }

    /// Starts over for a new attempt: buffer and attempt-local keys are dropped.
    pub fn reset(&mut self) {
        self.finish();
        self.keys.clear();
    }

    pub fn stats(&self) -> TranslationStats {
        self.stats
    }

    fn resolve(&self, reference: &str) -> Result<NodeId, UnitError> {
        let reference = reference.trim();
        if reference == "root" {
            return Ok(NodeId::ROOT);
        }
        if let Some(id) = self.keys.get(reference) {
            return Ok(*id);
        }
        reference
            .parse()
            .map_err(|_| UnitError::UnknownReference(reference.to_string()))
    }

    fn translate_unit(&mut self, unit: &str) -> Result<ScenePatch, UnitError> {
        let op: SceneOp =
            serde_json::from_str(unit).map_err(|e| UnitError::Malformed(e.to_string()))?;
        match op {
            SceneOp::Insert {
                key,
                parent,
                index,
                kind,
                props,
            } => {
                let parent = self.resolve(&parent)?;
                if let Some(key) = key.as_deref()
                    && self.keys.contains_key(key)
                {
                    return Err(UnitError::DuplicateKey(key.to_string()));
                }
                validate_props(kind, &props).map_err(|e| UnitError::InvalidProps(e.to_string()))?;
                let target = self
                    .ids
                    .next_node_id()
                    .map_err(|e| UnitError::Allocation(e.to_string()))?;
                if let Some(key) = key {
                    self.keys.insert(key, target);
                }
                Ok(ScenePatch::Insert {
                    target,
                    parent,
                    index,
                    kind,
                    props,
                })
            }
            SceneOp::Update { target, props } => Ok(ScenePatch::Update {
                target: self.resolve(&target)?,
                props,
            }),
            SceneOp::Delete { target } => Ok(ScenePatch::Delete {
                target: self.resolve(&target)?,
            }),
            SceneOp::Move {
                target,
                parent,
                index,
            } => Ok(ScenePatch::Move {
                target: self.resolve(&target)?,
                parent: self.resolve(&parent)?,
                index,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter(AtomicU64);

    impl NodeIdSource for Counter {
        fn next_node_id(&self) -> Result<NodeId, StoreError> {
            Ok(NodeId::new(self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    fn translator() -> PatchTranslator {
        PatchTranslator::new(Arc::new(Counter(AtomicU64::new(1))))
    }

    #[test]
    fn scanner_completes_objects_across_chunks() {
        let mut scanner = ObjectScanner::default();
        assert!(scanner.push("Here is the page:\n{\"op\":\"insert\",").is_empty());
        assert!(scanner.has_partial());
        let done = scanner.push("\"props\":{\"a\":1}}\n{\"op\"");
        assert_eq!(done, vec!["{\"op\":\"insert\",\"props\":{\"a\":1}}".to_string()]);
        assert!(scanner.has_partial());
    }

    #[test]
    fn scanner_ignores_braces_inside_strings() {
        let mut scanner = ObjectScanner::default();
        let done = scanner.push(r#"{"content":"a } \" { b"} trailing"#);
        assert_eq!(done.len(), 1);
        assert!(!scanner.has_partial());
    }

    #[test]
    fn keys_resolve_to_allocated_ids_in_order() {
        let mut t = translator();
        let patches = t.push_chunk(concat!(
            "```json\n",
            r#"{"op":"insert","key":"hero","parent":"root","kind":"container"}"#,
            "\n",
            r#"{"op":"insert","parent":"hero","kind":"text","props":{"content":"Hi"}}"#,
            "\n```",
        ));
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].target(), NodeId::new(1));
        assert!(matches!(
            &patches[1],
            ScenePatch::Insert { parent, target, .. }
                if *parent == NodeId::new(1) && *target == NodeId::new(2)
        ));
    }

    #[test]
    fn malformed_and_unknown_units_are_dropped_not_emitted() {
        let mut t = translator();
        let patches = t.push_chunk(concat!(
            r#"{"op":"explode","target":"root"}"#,
            r#"{"op":"delete","target":"ghost"}"#,
            r#"{"op":"insert","parent":"root","kind":"image","props":{}}"#,
            r#"{"op":"delete","target":"n4"}"#,
        ));
        assert_eq!(patches, vec![ScenePatch::Delete { target: NodeId::new(4) }]);
        assert_eq!(t.stats().dropped, 3);
    }

    #[test]
    fn reset_discards_partial_unit_and_keys() {
        let mut t = translator();
        t.push_chunk(r#"{"op":"insert","key":"a","parent":"root","kind":"container"}"#);
        t.push_chunk(r#"{"op":"insert","parent":"a","kind":"te"#);
        t.reset();
        assert_eq!(t.stats().discarded_partials, 1);
        // The tail of the abandoned unit must not combine with new output.
        let patches = t.push_chunk(r#"xt"}{"op":"delete","target":"a"}"#);
        assert!(patches.is_empty());
        assert_eq!(t.stats().dropped, 1);
    }
}
