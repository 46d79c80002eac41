//! `forge` binary: runs the generation pipeline, scans and executes code.

use clap::{Parser, Subcommand};
use forge_agent::ApiKeys;
use forge_orchestrator::{CancelToken, ForgeConfig, GenerationRequest, Orchestrator};
use forge_sandbox::SecureExecutor;
use forge_security::CodeSecurityScanner;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forge", about = "Forge - multi-agent code generation pipeline")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "forge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a generation request through the pipeline
    Generate {
        /// JSON file holding the GenerationRequest
        #[arg(short, long)]
        request: PathBuf,
    },
    /// Statically scan a Python file
    Scan {
        file: PathBuf,
    },
    /// Scan and run a Python file in the sandbox
    Execute {
        file: PathBuf,
    },
}

/// Reads `path`, falling back to defaults when the file does not exist.
async fn load_config(path: &Path) -> anyhow::Result<ForgeConfig> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(ForgeConfig::default());
    }
    Ok(ForgeConfig::load(path).await?)
}

async fn load_request(path: &Path) -> anyhow::Result<GenerationRequest> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read request file '{}': {e}", path.display())
    })?;
    let request: GenerationRequest = serde_json::from_str(&raw)?;
    request.validate()?;
    Ok(request)
}

async fn generate(config: &ForgeConfig, request: GenerationRequest) -> anyhow::Result<bool> {
    let keys = ApiKeys::from_env();
    let orchestrator = Orchestrator::from_config(config, &keys).await?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let response = orchestrator.execute_with_cancel(request, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    let report = orchestrator
        .router()
        .ledger()
        .report(chrono::Duration::days(30));
    println!("{}", serde_json::to_string_pretty(&report)?);

    let analysis = orchestrator.router().analyze_routing().await;
    println!("{}", serde_json::to_string_pretty(&analysis)?);

    Ok(response.success)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // API keys may live in a local .env file.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let ok = match cli.command {
        Commands::Generate { request } => {
            let request = load_request(&request).await?;
            info!(project = %request.project_name, "Starting generation");
            generate(&config, request).await?
        }
        Commands::Scan { file } => {
            let code = tokio::fs::read_to_string(&file).await?;
            let result = CodeSecurityScanner::new()?.scan(&code);
            println!("{}", serde_json::to_string_pretty(&result)?);
            result.safe
        }
        Commands::Execute { file } => {
            let code = tokio::fs::read_to_string(&file).await?;
            let executor = SecureExecutor::from_config(&config.sandbox).await?;
            info!(
                backend = executor.backend_name(),
                degraded = executor.is_degraded(),
                "Executing file"
            );
            let result = executor.execute(&code).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            result.success
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
