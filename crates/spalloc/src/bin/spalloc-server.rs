use std::path::PathBuf;

use clap::Parser;

use spalloc::common::setup::setup_logging;
use spalloc::server::bootstrap::{ServerOptions, run_server};

/// Partitioning and allocation server for SpiNNaker machines
#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// Configuration file
    #[arg(default_value = "spalloc.toml")]
    config: PathBuf,

    /// Ignore any saved state and start with no jobs
    #[arg(long)]
    cold_start: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Port to listen on, overrides the configuration file
    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on, overrides the configuration file
    #[arg(long)]
    ip: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    setup_logging(opts.debug);

    let result = run_server(ServerOptions {
        config_path: opts.config,
        cold_start: opts.cold_start,
        port: opts.port,
        ip: opts.ip,
    })
    .await;
    if let Err(error) = &result {
        log::error!("{error:#}");
    }
    result
}
