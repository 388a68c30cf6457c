use crate::model::ProviderId;

/// Input content sent to a model run.
///
/// The enum is non-exhaustive so new content kinds can be added without
/// breaking callers.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum InputPart {
    /// Plain text input.
    Text(String),
    /// Structured JSON input (for example the current document).
    Json(serde_json::Value),
}

/// Renders input parts as one user message body, JSON parts serialized inline.
pub fn render_input_parts(parts: &[InputPart]) -> Result<String, serde_json::Error> {
    let mut segments = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            InputPart::Text(text) => segments.push(text.clone()),
            InputPart::Json(value) => segments.push(serde_json::to_string(value)?),
        }
    }
    Ok(segments.join("\n"))
}

/// Output content produced by a model run.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum OutputPart {
    /// Plain text output.
    Text(String),
    /// Structured JSON output.
    Json(serde_json::Value),
}

/// Response of record for a succeeded request: the winning attempt's output.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunOutput {
    /// Provider whose attempt succeeded.
    pub provider: ProviderId,
    /// 1-based attempt number within the request.
    pub attempt: u32,
    /// Output parts in the order they were produced.
    pub parts: Vec<OutputPart>,
    /// Vendor-specific finish reason when available (for example `stop`).
    pub finish_reason: Option<String>,
}

impl RunOutput {
    /// Concatenates all text parts in order and ignores non-text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let OutputPart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_concatenates_text_parts_only() {
        let output = RunOutput {
            provider: ProviderId::new("p"),
            attempt: 1,
            parts: vec![
                OutputPart::Text("hello".into()),
                OutputPart::Json(serde_json::json!({"a":1})),
                OutputPart::Text(" world".into()),
            ],
            finish_reason: None,
        };
        assert_eq!(output.text(), "hello world");
    }

    #[test]
    fn json_parts_render_inline() {
        let rendered = render_input_parts(&[
            InputPart::Text("make a page".into()),
            InputPart::Json(serde_json::json!({"revision": 3})),
        ])
        .expect("render");
        assert_eq!(rendered, "make a page\n{\"revision\":3}");
    }
}
