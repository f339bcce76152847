//! patchlens: activation patching and logit lens service

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use patchlens::config::ServiceConfig;
use patchlens::jobs::JobRegistry;
use patchlens::server::{build_router, spawn_reaper, AppState};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "patchlens")]
#[command(about = "Activation patching and logit lens over HTTP")]
#[command(version)]
struct Cli {
    /// Path to a JSON service config (serves the toy model when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if cli.cpu {
        config.force_cpu();
    }

    info!("Loading models...");
    let models = config.build_models()?;
    for model in models.values() {
        info!(
            "Model: {} ({} layers, {} heads, {})",
            model.name(),
            model.n_layers(),
            model.n_heads(),
            model.backend().kind()
        );
    }

    let registry = Arc::new(JobRegistry::new(config.stream_capacity));
    spawn_reaper(Arc::clone(&registry), config.abandoned_ttl());

    let state = Arc::new(AppState::new(models, registry));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("Listening on {}", config.bind);
    axum::serve(listener, app).await?;

    Ok(())
}
