//! # Remediation Orchestrator
//!
//! Process entry point for the background side of the remediation core:
//! the correction sweeper, plus a configuration check for deployments.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use remediation_core::config::ConfigManager;
use remediation_core::database::PgStore;
use remediation_core::logging;
use remediation_core::orchestration::CorrectionSweeper;

#[derive(Parser, Debug)]
#[command(name = "remediation-orchestrator")]
#[command(about = "Background services for CVE remediation tasks")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration directory (default: config/remediation)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Environment overlay to apply (default: REMEDIATION_ENV, then development)
    #[arg(short, long)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the correction sweeper against PostgreSQL until Ctrl-C
    Sweep {
        /// Apply pending migrations before starting
        #[arg(long)]
        migrate: bool,
    },

    /// Load and validate configuration, then print it
    ValidateConfig,
}

fn load_config(cli: &Cli) -> Result<Arc<ConfigManager>> {
    let manager = match cli.environment.as_deref() {
        Some(env) => ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), env),
        None => ConfigManager::load_from_directory(cli.config_dir.clone()),
    };
    manager.context("failed to load remediation configuration")
}

async fn sweep(manager: &ConfigManager, migrate: bool) -> Result<()> {
    let config = manager.config();
    if !config.correction.enabled {
        info!("Correction sweeper disabled by configuration");
        return Ok(());
    }
    if config.database.url.is_empty() {
        bail!("database.url must be set to run the sweeper");
    }

    let store = PgStore::connect(&config.database)
        .await
        .context("failed to connect to PostgreSQL")?;
    if migrate {
        store.migrate().await.context("failed to apply migrations")?;
    }

    let sweeper = CorrectionSweeper::new(Arc::new(store), config.correction.clone());
    let handle = tokio::spawn(async move {
        if let Err(e) = sweeper.run().await {
            error!(error = %e, "Correction sweeper stopped");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, stopping correction sweeper");
    handle.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let manager = load_config(&cli)?;
    logging::init_with_config(&manager.config().logging);

    match &cli.command {
        Commands::Sweep { migrate } => sweep(&manager, *migrate).await,
        Commands::ValidateConfig => {
            println!("environment: {}", manager.environment());
            println!("directory:   {}", manager.config_directory().display());
            println!("{:#?}", manager.config());
            Ok(())
        }
    }
}
