//! Process-wide tracing setup for the studio and the `orionix` binary.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const ENABLED_VAR: &str = "ORIONIX_OBSERVABILITY_ENABLED";
const LEVEL_VAR: &str = "ORIONIX_LOG_LEVEL";
const JSON_PATH_VAR: &str = "ORIONIX_JSON_LOG_PATH";
const DEFAULT_JSON_FILE: &str = "orionix.logs.jsonl";

/// Resolved logging settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservabilitySettings {
    pub enabled: bool,
    /// Filter directive; `RUST_LOG` or `info` applies when unset.
    pub level: Option<String>,
    /// JSON lines go to this file instead of the console.
    pub json_log_path: Option<PathBuf>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: None,
            json_log_path: None,
        }
    }
}

impl ObservabilitySettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            enabled: lookup(ENABLED_VAR)
                .map(|v| parse_bool(&v).unwrap_or(true))
                .unwrap_or(true),
            level: lookup(LEVEL_VAR).filter(|v| !v.trim().is_empty()),
            json_log_path: lookup(JSON_PATH_VAR)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn env_filter(level: Option<&str>) -> tracing_subscriber::EnvFilter {
    if let Some(level) = level
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize logging once per process from the environment.
///
/// Environment variables:
/// - `ORIONIX_OBSERVABILITY_ENABLED`: `false` turns logging off (default enabled).
/// - `ORIONIX_LOG_LEVEL`: level or filter directive (`info`, `orionix_studio=debug`, ...).
/// - `RUST_LOG`: used when `ORIONIX_LOG_LEVEL` is unset.
/// - `ORIONIX_JSON_LOG_PATH`: write JSON lines to this file; otherwise compact console output on stderr.
pub fn init_observability() {
    init_with(ObservabilitySettings::from_env());
}

/// Like [`init_observability`] with explicit settings. Later calls are no-ops.
pub fn init_with(settings: ObservabilitySettings) {
    INIT.get_or_init(|| {
        if !settings.enabled {
            return;
        }

        let filter = env_filter(settings.level.as_deref());
        match settings.json_log_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    let _ = std::fs::create_dir_all(parent);
                }
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(DEFAULT_JSON_FILE);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(json_layer)
                    .try_init();
            }
            None => {
                // stdout carries generation events, so console logs go to stderr.
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
