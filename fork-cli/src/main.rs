//! This binary snapshots a live chain and writes the genesis of a fork of it.

mod config;

use anyhow::Context;
use clap::Parser;
use fork_genesis::ForkPipeline;
use fork_substrate_adapter::{SubstrateRpcService, SubsystemListFile};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::Args;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Unable to set global default subscriber")?;

    let args = Args::parse();
    if let Some(path) = &args.config {
        info!("Reading fork config from {path:?}");
    }
    let config = args
        .load_config()
        .context("Failed to read fork configuration")?;

    info!("Connecting to {}", config.rpc.url);
    let service = SubstrateRpcService::new(&config.rpc)?;
    let subsystems = SubsystemListFile::new(&config.fork.paths.subsystems);

    let report = ForkPipeline::new(&service, &subsystems, &config.fork, args.refresh)
        .run()
        .await?;

    if let Some(fetch) = &report.fetch {
        info!(
            chunks = fetch.chunks_completed,
            pairs = fetch.pairs_written,
            jumps = fetch.bound_jumps,
            requests = service.requests_sent(),
            "Fetched chain state"
        );
    }
    info!(
        output = ?report.output,
        kept = report.merge.kept,
        removed = report.merge.removed,
        "Forked genesis is ready"
    );
    Ok(())
}
