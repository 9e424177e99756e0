//! This module implements the CLI interface.
//!
//! All knobs of the exerciser are command line options; there is no
//! configuration file.
use std::num::ParseIntError;

use clap::Parser;

use crate::workload::WorkloadConfig;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Number of TRBs in the Transfer Ring, including the Link TRB.
    #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u16).range(2..))]
    transfer_ring_size: u16,

    /// Number of TRBs in the Event Ring.
    #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u16).range(2..))]
    event_ring_size: u16,

    /// Number of transfers to push through the rings.
    #[arg(long, default_value_t = 64)]
    transfers: u64,

    /// Number of chained TRBs that make up a single transfer.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    trbs_per_transfer: u16,

    /// The first physical address the DMA allocator hands out. Accepts
    /// decimal or 0x-prefixed hexadecimal values.
    #[arg(long, default_value = "0x80000000", value_parser = parse_address)]
    iova_base: u64,

    /// Maximum number of bytes of DMA memory. Omit this option for no
    /// limit.
    #[arg(long, value_name = "BYTES", value_parser = parse_address)]
    dma_budget: Option<u64>,
}

fn parse_address(value: &str) -> Result<u64, ParseIntError> {
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => value.replace('_', "").parse(),
    }
}

impl Cli {
    pub fn workload_config(&self) -> WorkloadConfig {
        WorkloadConfig {
            transfer_ring_size: self.transfer_ring_size.into(),
            event_ring_size: self.event_ring_size.into(),
            transfers: self.transfers,
            trbs_per_transfer: self.trbs_per_transfer.into(),
            iova_base: self.iova_base,
            dma_budget: self.dma_budget,
        }
    }
}
