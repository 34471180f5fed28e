use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dex_storage::open_store;
use dex_sync::{DependencyGraph, RunOptions, SyncConfig, SyncPipeline, ValidationPolicy};
use dex_web::AppState;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dex-cli")]
#[command(about = "Incremental catalog document sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, diff and write the requested categories (all when none given).
    Sync {
        categories: Vec<String>,
        /// Persist changes; without it the run only reports what would be written.
        #[arg(long)]
        commit: bool,
        #[arg(long)]
        epoch: Option<i64>,
        #[arg(long)]
        revision: Option<String>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        validation: Option<ValidationPolicy>,
    },
    /// Print the resolved category order.
    Plan { categories: Vec<String> },
    /// Serve the read-only query API.
    Serve {
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync {
            categories,
            commit,
            epoch,
            revision,
            message,
            data_dir,
            validation,
        } => {
            let mut config = SyncConfig::from_env();
            config.commit |= commit;
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(policy) = validation {
                config.validation = policy;
            }
            if config.commit && config.database_url.is_none() {
                warn!("DATABASE_URL is not set; running as a dry run");
                config.commit = false;
            }

            let store = open_store(config.database_url.as_deref()).await?;
            let pipeline = SyncPipeline::new(config, store).context("building sync pipeline")?;
            let summary = pipeline
                .run_once(&RunOptions {
                    categories,
                    epoch,
                    revision,
                    message,
                })
                .await
                .context("sync run failed")?;
            let report = &summary.report;
            println!(
                "sync complete: run_id={} epoch={} revision={} committed={} changed={} written={} report={}",
                report.run_id,
                report.epoch,
                report.revision,
                report.committed,
                report.changed(),
                report.written(),
                summary.report_path.display()
            );
        }
        Commands::Plan { categories } => {
            let graph = DependencyGraph::from_stages(&dex_stages::catalog())?;
            for name in graph.resolve(&categories)? {
                println!("{name}");
            }
        }
        Commands::Serve { addr } => {
            let config = SyncConfig::from_env();
            let store = open_store(config.database_url.as_deref()).await?;
            let addr = addr.unwrap_or_else(dex_web::addr_from_env);
            dex_web::serve(addr, AppState::new(store)).await?;
        }
    }

    Ok(())
}
