//! listscout CLI: budget-bounded research of new links for awesome lists.
//!
//! Researches every category of a curated list in parallel under a cost
//! ceiling and a wall-time limit, then deduplicates the findings against
//! the list and against each other.

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
