//! Pipewright CLI: drive the content pipeline from the terminal.
//!
//! Submits items, runs agent batches, inspects jobs and replays recorded
//! runs against the local pipeline database.

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
