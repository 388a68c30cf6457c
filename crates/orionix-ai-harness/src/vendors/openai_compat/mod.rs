//! OpenAI-compatible Chat Completions integration (OpenAI, DeepSeek, Qwen).
//!
//! Vendor-specific configuration lives here so the root harness API can remain
//! provider-agnostic.
mod adapter;
mod config;
mod options;
pub(crate) mod transport;

pub use adapter::OpenAiCompatProvider;
pub use config::{OpenAiCompatConfig, VendorPreset};
pub use options::OpenAiCompatOptions;

use crate::model::ProviderId;
use crate::run::RunBuilder;

/// Extension trait for attaching per-run chat-completion options to a `RunBuilder`.
pub trait OpenAiCompatRunBuilderExt {
    /// Adds options read only by the provider registered as `provider`.
    fn openai_compat_options(self, provider: impl Into<ProviderId>, options: OpenAiCompatOptions) -> Self;
}

impl OpenAiCompatRunBuilderExt for RunBuilder {
    fn openai_compat_options(self, provider: impl Into<ProviderId>, options: OpenAiCompatOptions) -> Self {
        self.set_vendor_options_json(provider.into(), options.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Harness;

    #[test]
    fn run_builder_ext_stores_options_under_provider_key() {
        let harness = Harness::builder().build().expect("harness");
        let builder = harness
            .run()
            .user_text("hello")
            .openai_compat_options("qwen", OpenAiCompatOptions::default().temperature(0.2));

        let value = builder
            .vendor_options_value(&ProviderId::new("qwen"))
            .expect("stored option");
        let parsed: OpenAiCompatOptions = serde_json::from_value(value.clone()).expect("parse");
        assert_eq!(parsed.temperature, Some(0.2));
        assert_eq!(parsed.max_tokens, None);
    }
}
