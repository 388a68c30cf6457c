/// Per-run overrides for OpenAI-compatible chat completions.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OpenAiCompatOptions {
    /// Sampling temperature; the client default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Output token cap; the client default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl OpenAiCompatOptions {
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::Map::new();
        if let Some(temperature) = self.temperature {
            value.insert("temperature".into(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = self.max_tokens {
            value.insert("max_tokens".into(), serde_json::json!(max_tokens));
        }
        serde_json::Value::Object(value)
    }
}
