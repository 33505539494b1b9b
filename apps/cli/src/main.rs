//! recsync CLI: reconcile records from an unreliable source into one CSV table.
//!
//! Fetches each record with bounded retries, merges the results into a
//! persistent artifact whose columns grow as new fields appear, and writes
//! filtered exports on demand.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
