//! Command-line runner for the convomirror sync service.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use convomirror_api::{HttpRemoteApi, StaticCredentials};
use convomirror_core::{
    FsStore, Identity, NamedLocks, Orchestrator, StatusPublisher, SyncConfig, SyncService,
};

use crate::config::FileConfig;

#[derive(Parser)]
#[command(name = "convomirror", about = "Mirror a workspace conversation archive locally")]
struct Cli {
    /// Path to the config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic sync service until interrupted.
    Run {
        /// Override the cycle interval from the config file, in seconds.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Run a single sync pass and exit.
    Once {
        /// Visit every page of every scope instead of stopping at the
        /// first clean page.
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let file_config = FileConfig::load(cli.config.as_deref())?;

    let identity = Identity {
        account_id: file_config.workspace_id.clone(),
        label: file_config.email.clone(),
    };
    let credentials = Arc::new(StaticCredentials::new(
        file_config.session_token()?,
        identity,
    ));
    let api = Arc::new(HttpRemoteApi::new(
        &file_config.base_url,
        &file_config.workspace_id,
        credentials.clone(),
    )?);
    let mirror_root = file_config.mirror_root()?;
    let store = Arc::new(FsStore::new(&mirror_root));
    let mut sync_config: SyncConfig = (&file_config).into();

    let locks = NamedLocks::new();
    let orchestrator = Arc::new(Orchestrator::new(
        api,
        store,
        credentials,
        locks.clone(),
        sync_config.clone(),
        Arc::new(StatusPublisher::new()),
    ));

    match cli.command {
        Command::Run { interval_secs } => {
            if let Some(secs) = interval_secs {
                sync_config.interval = Duration::from_secs(secs);
            }
            info!(
                root = %mirror_root.display(),
                interval_secs = sync_config.interval.as_secs(),
                "starting sync service"
            );

            let service = Arc::new(SyncService::new(orchestrator, locks, &sync_config));
            let mut status = service.subscribe();
            tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let snapshot = status.borrow().clone();
                    info!(
                        phase = ?snapshot.phase,
                        role = ?snapshot.role,
                        "{}",
                        snapshot.message
                    );
                }
            });

            let handle = service.start();
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            info!("interrupt received, stopping");
            service.stop();
            handle.await.context("joining sync loop")?;
        }
        Command::Once { full } => {
            let outcome = orchestrator.run_cycle(full).await?;
            println!("{}", outcome.message);
        }
    }

    Ok(())
}
