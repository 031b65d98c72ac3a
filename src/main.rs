mod api;
mod cli;
mod history;
mod model;
mod nodes;
mod orchestrator;
mod progress;
mod runs;
mod storage;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr so piped JSON output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();
    cli::run(args).await
}
