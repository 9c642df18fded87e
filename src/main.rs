mod cli;
mod config;
mod engine;
mod logging;
mod model;
mod orchestrator;
mod process;
mod text_summary;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let code = cli::run(args).await?;
    // Exit explicitly; a detached keep-alive task must not keep the runtime alive.
    std::process::exit(code);
}
