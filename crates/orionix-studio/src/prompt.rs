use orionix_ai_harness::InputPart;
use orionix_scene::DocumentSnapshot;

/// Instructions that make a model answer in scene operations.
pub const SYSTEM_PROMPT: &str = r#"You are a website designer that edits a scene document.
Reply only with scene operations, one JSON object per operation, in the order they must be applied:
{"op":"insert","key":"<new name>","parent":"<ref>","index":<optional position>,"kind":"<kind>","props":{...}}
{"op":"update","target":"<ref>","props":{...}}   (a null value removes a property)
{"op":"move","target":"<ref>","parent":"<ref>","index":<optional position>}
{"op":"delete","target":"<ref>"}
A <ref> is "root", an existing node id such as "n4", or a key introduced by an earlier insert of your answer.
Kinds and their required props: container, text (content), image (src), video (src), shape (shape: rectangle|circle|ellipse|line), mesh (geometry: box|sphere|plane|cylinder), light (light: ambient|point|directional|spot).
Only container and mesh nodes may have children.
Every kind also accepts name, visible, color, opacity (0..1), position, rotation, scale ([x,y,z]), width, height and style (object).
Optional props: container layout (stack|row|grid|free), text font_size (greater than 0), image alt, video autoplay and looping, mesh material (object), light intensity.
Do not use any other property."#;

/// Builds the user input for one request: the prompt, then the current
/// document when it already has content.
pub fn build_input(prompt: &str, document: Option<&DocumentSnapshot>) -> Vec<InputPart> {
    let mut parts = vec![InputPart::Text(prompt.trim().to_string())];
    if let Some(snapshot) = document.filter(|s| !s.root.children.is_empty()) {
        parts.push(InputPart::Text(
            "Current document (edit it rather than starting over):".to_string(),
        ));
        parts.push(InputPart::Json(serde_json::json!({
            "revision": snapshot.revision,
            "root": snapshot.root,
        })));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use orionix_scene::{NodeKind, PatchSource, ScenePatch, SceneStore};

    #[test]
    fn empty_document_is_not_sent() {
        let store = SceneStore::default();
        let doc = store.create_document("t");
        let snapshot = store.get(doc).expect("snapshot");
        let parts = build_input("  a bakery site ", Some(&snapshot));
        assert_eq!(parts, vec![InputPart::Text("a bakery site".into())]);
    }

    #[test]
    fn existing_content_is_attached_as_json() {
        let store = SceneStore::default();
        let doc = store.create_document("t");
        let id = store.allocate_node_id(doc).expect("id");
        store
            .apply(
                doc,
                ScenePatch::Insert {
                    target: id,
                    parent: orionix_scene::NodeId::ROOT,
                    index: None,
                    kind: NodeKind::Container,
                    props: Default::default(),
                },
                PatchSource::Manual,
            )
            .expect("insert");
        let snapshot = store.get(doc).expect("snapshot");
        let parts = build_input("make it blue", Some(&snapshot));
        assert_eq!(parts.len(), 3);
        let InputPart::Json(value) = &parts[2] else {
            panic!("expected json part");
        };
        assert_eq!(value["revision"], serde_json::json!(1));
        assert_eq!(value["root"]["children"][0]["id"], serde_json::json!(id.to_string()));
    }
}
