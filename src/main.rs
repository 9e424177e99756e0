mod cli;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use workload::Workload;

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;
    tracing_log::LogTracer::init().context("Failed to forward log records to tracing")?;

    let config = args.workload_config();
    info!(
        "pushing {} transfers through a {}-TRB transfer ring and a {}-TRB event ring",
        config.transfers, config.transfer_ring_size, config.event_ring_size
    );

    let summary = Workload::new(config)
        .context("Failed to set up rings")?
        .run()
        .context("Failed to run workload")?;

    info!(
        "completed {} transfers ({} TRBs, {} events) with {} doorbells; the transfer ring wrapped {} times",
        summary.transfers,
        summary.trbs,
        summary.events,
        summary.doorbells,
        summary.transfer_ring_wraps
    );

    Ok(())
}
