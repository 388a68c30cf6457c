//! Scripted providers that stand in for network vendors.
//!
//! The offline provider streams a small landing page for the prompt in short
//! chunks so the full pipeline (failover, translation, commits) runs without
//! API keys.

use std::sync::Arc;
use std::time::Duration;

use orionix_ai_harness::vendors::scripted::{ScriptStep, ScriptedProvider};
use orionix_ai_harness::{Harness, HarnessError, ProviderSpec};
use serde_json::json;

use crate::config::StudioConfig;

pub const OFFLINE_PROVIDER: &str = "offline";
pub const FLAKY_PROVIDER: &str = "offline-flaky";

const CHUNK_CHARS: usize = 48;
const CHUNK_DELAY: Duration = Duration::from_millis(15);

/// Scene units of the canned landing page, one JSON object per unit.
pub fn site_units(prompt: &str) -> Vec<String> {
    let headline = prompt.trim();
    [
        json!({"op": "insert", "key": "page", "parent": "root", "kind": "container",
               "props": {"name": "page", "layout": "stack"}}),
        json!({"op": "insert", "key": "hero", "parent": "page", "kind": "container",
               "props": {"name": "hero", "layout": "stack", "style": {"padding": "64px"}}}),
        json!({"op": "insert", "parent": "hero", "kind": "text",
               "props": {"name": "headline", "content": headline, "font_size": 48}}),
        json!({"op": "insert", "parent": "hero", "kind": "text",
               "props": {"name": "tagline", "content": "Designed and built in minutes", "font_size": 20, "opacity": 0.8}}),
        json!({"op": "insert", "key": "features", "parent": "page", "kind": "container",
               "props": {"name": "features", "layout": "row"}}),
        json!({"op": "insert", "parent": "features", "kind": "text",
               "props": {"name": "feature-fast", "content": "Fast"}}),
        json!({"op": "insert", "parent": "features", "kind": "text",
               "props": {"name": "feature-responsive", "content": "Responsive"}}),
        json!({"op": "insert", "parent": "features", "kind": "text",
               "props": {"name": "feature-accessible", "content": "Accessible"}}),
        json!({"op": "insert", "parent": "page", "kind": "shape",
               "props": {"name": "divider", "shape": "line", "width": 960}}),
        json!({"op": "insert", "parent": "page", "kind": "text",
               "props": {"name": "footer", "content": "Made with Orionix", "font_size": 12}}),
    ]
    .iter()
    .map(|unit| unit.to_string())
    .collect()
}

/// Splits `text` into pieces of at most `size` characters.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|piece| piece.iter().collect())
        .collect()
}

fn streamed(text: &str) -> Vec<ScriptStep> {
    let mut steps = Vec::new();
    for piece in chunk_text(text, CHUNK_CHARS) {
        steps.push(ScriptStep::Delta(piece));
        steps.push(ScriptStep::Delay(CHUNK_DELAY));
    }
    steps
}

/// Harness backed by the offline provider. With `flaky`, a higher-priority
/// provider streams part of the page and then fails, forcing a failover.
pub fn offline_harness(
    config: &StudioConfig,
    prompt: &str,
    flaky: bool,
) -> Result<Harness, HarnessError> {
    let units = site_units(prompt);
    let body = format!("Here is your page:\n{}\n", units.join("\n"));
    let mut complete = streamed(&body);
    complete.push(ScriptStep::Complete);

    let mut builder = config.harness_builder().register_provider(
        ProviderSpec::new(OFFLINE_PROVIDER, "canned-site").priority(2),
        Arc::new(ScriptedProvider::new(OFFLINE_PROVIDER).with_script(complete)),
    );
    if flaky {
        let half = units[..units.len() / 2].join("\n");
        let mut partial = streamed(&half);
        partial.push(ScriptStep::FailTransient("simulated upstream reset".into()));
        builder = builder.register_provider(
            ProviderSpec::new(FLAKY_PROVIDER, "canned-site").priority(1),
            Arc::new(ScriptedProvider::new(FLAKY_PROVIDER).with_script(partial)),
        );
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{GenerationRequest, Studio};
    use crate::events::StatusPayload;

    #[test]
    fn chunks_respect_char_boundaries() {
        let pieces = chunk_text("héllo wörld", 4);
        assert_eq!(pieces, ["héll", "o wö", "rld"]);
        assert_eq!(pieces.concat(), "héllo wörld");
    }

    #[test]
    fn prompt_is_escaped_into_the_headline() {
        let units = site_units(r#"Bakery "Crumbs" {est. 1999}"#);
        let headline: serde_json::Value = serde_json::from_str(&units[2]).expect("json");
        assert_eq!(headline["props"]["content"], json!(r#"Bakery "Crumbs" {est. 1999}"#));
    }

    #[tokio::test]
    async fn flaky_offline_run_builds_the_whole_page_once() {
        let config = StudioConfig::default();
        let harness = offline_harness(&config, "Bakery", true).expect("harness");
        let studio = Studio::from_config(&config, harness);
        let doc = studio.create_document("offline");
        let session = studio.open_session(doc).expect("session");

        let summary = session
            .submit(GenerationRequest::new("Bakery"))
            .await
            .expect("submit")
            .finish()
            .await
            .expect("summary");

        assert!(matches!(
            &summary.status,
            StatusPayload::Succeeded { provider, attempt: 2, committed: 10, .. } if provider.as_str() == OFFLINE_PROVIDER
        ));
        assert!(summary.revoked > 0);
        let snapshot = studio.get_document(doc).expect("snapshot");
        assert_eq!(snapshot.root.children.len(), 1);
        assert_eq!(snapshot.root.children[0].children.len(), 4);
        assert!(studio.store().verify(doc).expect("verify"));
    }
}
