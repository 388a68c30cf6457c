//! Studio configuration: provider list, failover timings and channel sizes.
//!
//! Configuration is a JSON file named by `--config` or `ORIONIX_CONFIG`. When
//! neither is given the three vendor presets are used with their default
//! models, in DeepSeek, OpenAI, Qwen order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use orionix_ai_harness::vendors::openai_compat::{
    OpenAiCompatConfig, OpenAiCompatProvider, VendorPreset,
};
use orionix_ai_harness::{
    Harness, HarnessBuilder, HarnessError, HealthPolicy, ProviderSpec, RunOptions,
};
use tracing::{info, warn};

/// Variable naming the config file when `--config` is absent.
pub const CONFIG_PATH_VAR: &str = "ORIONIX_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

/// Loads `.env` from the crate directory and then from the working directory.
pub fn init_env() {
    let _ = dotenvy::from_path(Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.env")));
    dotenvy::dotenv().ok();
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

/// One provider entry of the config file.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: String,
    pub vendor: VendorPreset,
    /// Vendor default model when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Lower is tried first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Variable holding the API key; the vendor's usual variable when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
}

impl ProviderConfig {
    pub fn preset(vendor: VendorPreset, priority: u32) -> Self {
        Self {
            id: vendor.provider_id().as_str().to_string(),
            vendor,
            model: None,
            priority,
            enabled: true,
            base_url: None,
            api_key_env: None,
            supports_streaming: true,
        }
    }

    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.vendor.default_model())
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env
            .as_deref()
            .unwrap_or_else(|| self.vendor.api_key_env())
    }

    pub fn spec(&self) -> ProviderSpec {
        ProviderSpec::new(self.id.as_str(), self.model())
            .priority(self.priority)
            .enabled(self.enabled)
            .streaming(self.supports_streaming)
    }

    fn client_config(&self, api_key: String) -> OpenAiCompatConfig {
        let mut config = OpenAiCompatConfig::preset(self.vendor, api_key)
            .provider_id(self.id.as_str())
            .stream(self.supports_streaming);
        if let Some(base_url) = &self.base_url {
            config = config.base_url(base_url.clone());
        }
        config
    }
}

/// Top-level studio settings.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudioConfig {
    pub providers: Vec<ProviderConfig>,
    /// Consecutive transient failures before a provider is benched.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub default_deadline_ms: u64,
    pub min_attempt_budget_ms: u64,
    pub stream_buffer_capacity: usize,
    pub notification_capacity: usize,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderConfig::preset(VendorPreset::DeepSeek, 1),
                ProviderConfig::preset(VendorPreset::OpenAi, 2),
                ProviderConfig::preset(VendorPreset::Qwen, 3),
            ],
            failure_threshold: 3,
            cooldown_ms: 30_000,
            default_deadline_ms: 120_000,
            min_attempt_budget_ms: 0,
            stream_buffer_capacity: 128,
            notification_capacity: orionix_scene::DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl StudioConfig {
    /// Loads from `path`, else from `ORIONIX_CONFIG`, else defaults; always validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var(CONFIG_PATH_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), providers = config.providers.len(), "config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("at least one provider is required".into()));
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigError::Invalid("provider id must not be empty".into()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id `{}`",
                    provider.id
                )));
            }
        }
        for (name, value) in [
            ("failure_threshold", self.failure_threshold as u64),
            ("default_deadline_ms", self.default_deadline_ms),
            ("stream_buffer_capacity", self.stream_buffer_capacity as u64),
            ("notification_capacity", self.notification_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            deadline: self.deadline(),
            min_attempt_budget: Duration::from_millis(self.min_attempt_budget_ms),
            stream_buffer_capacity: self.stream_buffer_capacity,
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    /// Harness builder carrying this config's health policy and run defaults.
    pub fn harness_builder(&self) -> HarnessBuilder {
        Harness::builder()
            .health_policy(self.health_policy())
            .default_run_options(self.run_options())
    }

    /// Builds a harness with every provider whose API key is set.
    pub fn build_harness(&self) -> Result<Harness, ConfigError> {
        self.build_harness_with(|var| std::env::var(var).ok())
    }

    fn build_harness_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Harness, ConfigError> {
        let mut builder = self.harness_builder();
        let mut registered = 0usize;
        for provider in &self.providers {
            let key_var = provider.api_key_env();
            let Some(api_key) = lookup(key_var).filter(|k| !k.trim().is_empty()) else {
                warn!(provider = %provider.id, key_var, "not configured, skipping");
                continue;
            };
            let adapter = OpenAiCompatProvider::new(provider.client_config(api_key))?;
            builder = builder.register_provider(provider.spec(), Arc::new(adapter));
            registered += 1;
        }
        if registered == 0 {
            return Err(ConfigError::Invalid(
                "no provider has an API key; set one or run offline".into(),
            ));
        }
        Ok(builder.build()?)
    }
}
