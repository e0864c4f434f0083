//! gce-scaler - autoscales a Compute Engine instance group for Buildkite.

use anyhow::Result;
use clap::Parser;
use gce_scaler::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
