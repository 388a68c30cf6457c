use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use orionix_scene::{DocumentExport, PatchSource, ScenePatch, SceneStore};
use orionix_studio::config::{self, StudioConfig};
use orionix_studio::observability::init_observability;
use orionix_studio::offline::offline_harness;
use orionix_studio::{GenerationRequest, PatchResponse, Studio};
use tracing::info;

#[derive(Parser)]
#[command(name = "orionix", version, about = "Generate website scene documents with AI providers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (falls back to ORIONIX_CONFIG, then the built-in presets)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a generation into a document and print its events
    Generate {
        prompt: String,
        /// Document export to edit; written back when the run ends
        #[arg(long)]
        document_file: Option<PathBuf>,
        /// Request deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
        /// Try this provider first
        #[arg(long)]
        provider: Option<String>,
        /// Use the built-in scripted provider instead of network vendors
        #[arg(long)]
        offline: bool,
        /// With --offline, add a provider that fails mid-stream
        #[arg(long, requires = "offline")]
        simulate_failover: bool,
        /// Print SSE frames instead of JSON lines
        #[arg(long)]
        sse: bool,
    },
    /// List configured providers and their health
    Providers,
    /// Apply a JSON-lines patch file to a fresh document and print the result
    Validate {
        patches: PathBuf,
    },
}

struct GenerateArgs {
    prompt: String,
    document_file: Option<PathBuf>,
    deadline_ms: Option<u64>,
    provider: Option<String>,
    offline: bool,
    simulate_failover: bool,
    sse: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    config::init_env();
    init_observability();

    let cli = Cli::parse();
    match cli.command {
        Commands::Generate {
            prompt,
            document_file,
            deadline_ms,
            provider,
            offline,
            simulate_failover,
            sse,
        } => {
            let config = StudioConfig::load(cli.config.as_deref())?;
            let args = GenerateArgs {
                prompt,
                document_file,
                deadline_ms,
                provider,
                offline,
                simulate_failover,
                sse,
            };
            generate(&config, args).await
        }
        Commands::Providers => {
            let config = StudioConfig::load(cli.config.as_deref())?;
            list_providers(&config)
        }
        Commands::Validate { patches } => validate(&patches).await,
    }
}

async fn generate(config: &StudioConfig, args: GenerateArgs) -> Result<(), Box<dyn Error>> {
    let harness = if args.offline {
        offline_harness(config, &args.prompt, args.simulate_failover)?
    } else {
        config.build_harness()?
    };
    let studio = Studio::from_config(config, harness);

    let document = match &args.document_file {
        Some(path) if path.exists() => {
            let raw = tokio::fs::read_to_string(path).await?;
            let export: DocumentExport = serde_json::from_str(&raw)?;
            studio.import_document(export)?
        }
        _ => studio.create_document(args.prompt.trim()),
    };
    let session = studio.open_session(document)?;

    let mut request = GenerationRequest::new(args.prompt.as_str());
    if let Some(ms) = args.deadline_ms {
        request = request.deadline(Duration::from_millis(ms));
    }
    if let Some(provider) = args.provider {
        request = request.preferred_provider(provider);
    }

    let mut handle = session.submit(request).await?;
    while let Some(event) = handle.next_event().await {
        if args.sse {
            print!("{}", event.to_sse()?);
        } else {
            println!("{}", event.to_json()?);
        }
    }
    let summary = handle.finish().await?;
    session.close();

    if let Some(path) = &args.document_file {
        let export = studio.store().export(document)?;
        tokio::fs::write(path, serde_json::to_string_pretty(&export)?).await?;
        info!(path = %path.display(), "document written");
    }
    if summary.succeeded() {
        Ok(())
    } else {
        Err(format!("generation {} failed", summary.request_id).into())
    }
}

fn list_providers(config: &StudioConfig) -> Result<(), Box<dyn Error>> {
    let statuses = config
        .build_harness()
        .map(|harness| harness.providers())
        .unwrap_or_default();
    for provider in &config.providers {
        let status = statuses.iter().find(|s| s.id.as_str() == provider.id);
        let line = serde_json::json!({
            "id": provider.id,
            "vendor": provider.vendor,
            "model": provider.model(),
            "priority": provider.priority,
            "enabled": provider.enabled,
            "configured": status.is_some(),
            "api_key_env": provider.api_key_env(),
            "health": status.map(|s| s.health),
        });
        println!("{line}");
    }
    Ok(())
}

async fn validate(path: &Path) -> Result<(), Box<dyn Error>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let store = SceneStore::default();
    let document = store.create_document(path.display().to_string());
    let mut failed = 0usize;

    for (number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let number = number + 1;
        let outcome = match serde_json::from_str::<ScenePatch>(line) {
            Ok(patch) => {
                let result = store
                    .apply(document, patch, PatchSource::Manual)
                    .map(|applied| applied.revision);
                let response = PatchResponse::from_apply(result)?;
                if matches!(response, PatchResponse::Rejected { .. }) {
                    failed += 1;
                }
                serde_json::to_value(&response)?
            }
            Err(err) => {
                failed += 1;
                serde_json::json!({ "error": err.to_string() })
            }
        };
        println!("{}", serde_json::json!({ "line": number, "result": outcome }));
    }

    println!("{}", serde_json::to_string_pretty(&store.get(document)?)?);
    if failed == 0 {
        Ok(())
    } else {
        Err(format!("{failed} patch line(s) failed").into())
    }
}
