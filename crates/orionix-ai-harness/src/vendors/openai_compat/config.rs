use std::time::Duration;

use crate::errors::HarnessError;
use crate::model::ProviderId;

/// Known OpenAI-compatible vendors with their defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VendorPreset {
    OpenAi,
    DeepSeek,
    Qwen,
}

impl VendorPreset {
    pub const ALL: [VendorPreset; 3] = [VendorPreset::OpenAi, VendorPreset::DeepSeek, VendorPreset::Qwen];

    pub fn provider_id(self) -> ProviderId {
        ProviderId::new(match self {
            VendorPreset::OpenAi => "openai",
            VendorPreset::DeepSeek => "deepseek",
            VendorPreset::Qwen => "qwen",
        })
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            VendorPreset::OpenAi => "https://api.openai.com/v1",
            VendorPreset::DeepSeek => "https://api.deepseek.com/v1",
            VendorPreset::Qwen => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            VendorPreset::OpenAi => "gpt-4",
            VendorPreset::DeepSeek => "deepseek-chat",
            VendorPreset::Qwen => "qwen-plus",
        }
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            VendorPreset::OpenAi => "OPENAI_API_KEY",
            VendorPreset::DeepSeek => "DEEPSEEK_API_KEY",
            VendorPreset::Qwen => "QWEN_API_KEY",
        }
    }
}

/// Configuration for one OpenAI-compatible provider client.
#[derive(Clone, Debug)]
pub struct OpenAiCompatConfig {
    /// Id the provider registers under.
    pub provider_id: ProviderId,
    /// API key used for bearer auth.
    pub api_key: String,
    /// Base URL up to and including the API version (for example `.../v1`).
    pub base_url: String,
    /// Default HTTP timeout for requests.
    pub timeout: Duration,
    /// Request SSE streaming; when false the whole body arrives at completion.
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl OpenAiCompatConfig {
    /// Creates a config with the preset's defaults and a provided API key.
    pub fn preset(preset: VendorPreset, api_key: impl Into<String>) -> Self {
        Self {
            provider_id: preset.provider_id(),
            api_key: api_key.into(),
            base_url: preset.default_base_url().to_string(),
            timeout: Duration::from_secs(120),
            stream: true,
            max_tokens: 4000,
            temperature: 0.7,
        }
    }

    /// Builds a preset config from its API key variable (for example `DEEPSEEK_API_KEY`).
    pub fn from_env(preset: VendorPreset) -> Result<Self, HarnessError> {
        Self::from_env_var(preset, preset.api_key_env())
    }

    /// Builds a preset config reading the API key from `var`.
    pub fn from_env_var(preset: VendorPreset, var: &str) -> Result<Self, HarnessError> {
        let api_key = std::env::var(var).unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(HarnessError::Config(format!(
                "missing {var} for {} provider",
                preset.provider_id()
            )));
        }
        Ok(Self::preset(preset, api_key))
    }

    /// Registers the client under a different provider id.
    pub fn provider_id(mut self, id: impl Into<ProviderId>) -> Self {
        self.provider_id = id.into();
        self
    }

    /// Overrides the API base URL (for proxies or test servers).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the default HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub(crate) fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_carry_vendor_defaults() {
        let config = OpenAiCompatConfig::preset(VendorPreset::DeepSeek, "k");
        assert_eq!(config.provider_id.as_str(), "deepseek");
        assert_eq!(
            config.chat_completions_url(),
            "https://api.deepseek.com/v1/chat/completions"
        );
        assert_eq!(config.max_tokens, 4000);
        assert_eq!(VendorPreset::Qwen.default_model(), "qwen-plus");
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let err = OpenAiCompatConfig::from_env_var(VendorPreset::OpenAi, "ORIONIX_TEST_UNSET_KEY")
            .expect_err("missing");
        assert!(matches!(err, HarnessError::Config(msg) if msg.contains("ORIONIX_TEST_UNSET_KEY")));
    }
}
