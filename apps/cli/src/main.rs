//! LeadScout CLI: submit and track AI research jobs for lead discovery.
//!
//! Research jobs run remotely for minutes to hours; `watch` (or an external
//! scheduler calling `poll`) drives them to completion and merges the
//! results into the local record database.

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
