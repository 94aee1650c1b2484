//! varnika: research a topic on the web and write an article about it.
//!
//! Discovers sources for a query, fetches and condenses them, then writes
//! an article in a chosen format and writing style.

mod commands;
mod progress;

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
