use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use distiller_core::{
    resolve_paths, ConfigStore, CredentialStore, Distiller, DistillerOptions, DistillerPaths,
    RetryPolicy, MAX_TEMPERATURE,
};
use distiller_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use distiller_providers::{ProviderFactory, SUPPORTED_PROVIDER_IDS};
use distiller_types::{JobEvent, JobStatus, SourceArtifact};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "distiller")]
#[command(about = "Distill a book into a structured markdown document")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Distill one book, streaming the text to stdout.
    Run(RunArgs),
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Recently used prompts, most recent first.
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    file: PathBuf,
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    echo_turns: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Set {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        #[arg(long)]
        provider: Option<String>,
    },
    /// Stores the API key in the OS keychain, or a private file when no
    /// keychain is available.
    SetKey { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = resolve_paths()?;
    paths.ensure()?;
    let _log_guard = init_process_logging(ProcessKind::Cli, &paths.logs_dir, 14)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "cli.main",
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..Default::default()
        },
    );

    match cli.command {
        Command::Run(args) => run(&paths, args).await,
        Command::Config { action } => configure(&paths, action).await,
        Command::History { limit } => {
            let config = ConfigStore::new(&paths.config_path, None).await?;
            let history = config.prompt_history().await;
            if history.is_empty() {
                println!("No prompts recorded yet.");
            }
            for (index, prompt) in history
                .entries()
                .iter()
                .take(limit.unwrap_or(usize::MAX))
                .enumerate()
            {
                println!("{:>2}. {}", index + 1, first_line(prompt));
            }
            Ok(())
        }
    }
}

async fn run(paths: &DistillerPaths, args: RunArgs) -> anyhow::Result<()> {
    let artifact = load_artifact(&args.file)?;
    let seed_prompt = args
        .prompt_file
        .as_deref()
        .map(read_prompt_file)
        .transpose()?;
    let overrides = build_cli_overrides(CliOverrides {
        api_key: args.api_key,
        provider: args.provider,
        model: args.model,
        temperature: args.temperature,
        seed_prompt,
        echo_turns: args.echo_turns,
    })?;

    let config = ConfigStore::new(&paths.config_path, overrides).await?;
    if let Some(material) = CredentialStore::new(&paths.credential_path).load() {
        info!("api key resolved from {}", material.backend.as_str());
        config
            .patch_runtime(json!({ "api_key": material.secret }))
            .await?;
    }
    let app = config.get().await;
    let factory = ProviderFactory::new(app.provider.clone());
    let distiller = Distiller::new(
        Arc::new(factory),
        Arc::new(config.clone()),
        DistillerOptions {
            retry: RetryPolicy::from(&app.retry),
            process: ProcessKind::Cli,
        },
    );

    let stem = args
        .file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let printer = tokio::spawn(print_events(distiller.subscribe()));
    distiller.select_artifact(artifact).await;
    distiller.start().await?;

    let status = tokio::select! {
        status = distiller.wait_until_settled() => status,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nStopping...");
            distiller.stop().await?;
            JobStatus::Stopped
        }
    };
    printer.abort();
    println!();

    let target = args
        .out
        .unwrap_or_else(|| distiller_core::export_path_for(&stem, None));
    match status {
        JobStatus::Finished => {
            write_document(&target, &distiller.document().await)?;
            eprintln!("Saved {}", target.display());
            Ok(())
        }
        JobStatus::Error => {
            let snapshot = distiller.snapshot().await;
            let reason = snapshot
                .error
                .unwrap_or_else(|| "distillation failed".to_string());
            let document = distiller.document().await;
            if !document.is_empty() {
                let partial = partial_path_for(&target);
                write_document(&partial, &document)?;
                eprintln!("Saved the sections produced so far to {}", partial.display());
            }
            anyhow::bail!(
                "{reason} ({} section(s) were produced before the failure)",
                snapshot.output_log.len()
            )
        }
        other => {
            eprintln!("Distillation ended while {other}.");
            Ok(())
        }
    }
}

/// Text goes to stdout, system trace lines to stderr.
async fn print_events(mut events: broadcast::Receiver<JobEvent>) {
    let mut stdout = std::io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event.event_type.as_str() {
            "job.output.delta" => {
                if let Some(delta) = event.properties["delta"].as_str() {
                    let _ = stdout.write_all(delta.as_bytes());
                    let _ = stdout.flush();
                }
            }
            "job.turn.finalized" => {
                let _ = stdout.write_all(b"\n\n");
                let _ = stdout.flush();
            }
            "job.trace" if event.properties["role"] == "system" => {
                let content = event.properties["content"].as_str().unwrap_or_default();
                if !content.starts_with("[METADATA]") {
                    eprintln!("[distiller] {content}");
                }
            }
            _ => {}
        }
    }
}

async fn configure(paths: &DistillerPaths, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = ConfigStore::new(&paths.config_path, None).await?;
            let mut value = config.get_redacted_value().await;
            let backend = CredentialStore::new(&paths.credential_path)
                .load()
                .map(|m| m.backend.as_str())
                .unwrap_or("none");
            if let Some(root) = value.as_object_mut() {
                root.insert("api_key_source".to_string(), json!(backend));
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        ConfigAction::Set {
            model,
            temperature,
            prompt_file,
            provider,
        } => {
            let seed_prompt = prompt_file.as_deref().map(read_prompt_file).transpose()?;
            let Some(patch) = build_cli_overrides(CliOverrides {
                provider,
                model,
                temperature,
                seed_prompt,
                ..CliOverrides::default()
            })?
            else {
                anyhow::bail!("nothing to set; pass --model, --temperature, --prompt-file or --provider");
            };
            let config = ConfigStore::new(&paths.config_path, None).await?;
            config.patch_project(patch).await?;
            println!("{}", serde_json::to_string_pretty(&config.get_redacted_value().await)?);
        }
        ConfigAction::SetKey { key } => {
            if key.trim().is_empty() {
                anyhow::bail!("api key cannot be empty");
            }
            let backend = CredentialStore::new(&paths.credential_path).store(key.trim())?;
            println!("API key stored in {}.", backend.as_str());
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct CliOverrides {
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    seed_prompt: Option<String>,
    echo_turns: Option<usize>,
}

fn build_cli_overrides(overrides: CliOverrides) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(overrides.provider)?;
    let mut root = Map::new();
    let mut provider_config = Map::new();

    if let Some(p) = provider {
        provider_config.insert("id".to_string(), Value::String(p));
    }
    if let Some(turns) = overrides.echo_turns {
        provider_config.insert("echo_turns".to_string(), json!(turns));
    }
    if !provider_config.is_empty() {
        root.insert("provider".to_string(), Value::Object(provider_config));
    }
    if let Some(key) = overrides.api_key.filter(|k| !k.trim().is_empty()) {
        root.insert("api_key".to_string(), Value::String(key));
    }
    if let Some(model) = overrides.model.filter(|m| !m.trim().is_empty()) {
        root.insert("model".to_string(), Value::String(model.trim().to_string()));
    }
    if let Some(temperature) = overrides.temperature {
        if !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
            anyhow::bail!("temperature must be between 0 and {MAX_TEMPERATURE}");
        }
        root.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(prompt) = overrides.seed_prompt {
        root.insert("seed_prompt".to_string(), Value::String(prompt));
    }

    if root.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn load_artifact(path: &Path) -> anyhow::Result<SourceArtifact> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("book")
        .to_string();
    Ok(SourceArtifact::new(name, guess_mime_type(path), bytes))
}

fn write_document(target: &Path, document: &str) -> anyhow::Result<()> {
    std::fs::write(target, document).with_context(|| format!("failed to write {}", target.display()))
}

/// `book.md` becomes `book.partial.md`, next to the export target.
fn partial_path_for(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("distilled");
    let name = match target.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.partial.{ext}"),
        None => format!("{stem}.partial.md"),
    };
    target.with_file_name(name)
}

fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "epub" => "application/epub+zip",
        _ => "application/octet-stream",
    }
}

fn read_prompt_file(path: &Path) -> anyhow::Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read prompt file {}", path.display()))?;
    let prompt = raw.trim();
    if prompt.is_empty() {
        anyhow::bail!("prompt file {} is empty", path.display());
    }
    Ok(prompt.to_string())
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > 80 {
        let cut: String = line.chars().take(77).collect();
        return format!("{cut}...");
    }
    line.to_string()
}
