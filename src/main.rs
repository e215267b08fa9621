use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustllm_pipeline::cli::{self, Cli, Commands, RunArgs};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rustllm_pipeline=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run(RunArgs::default()).await?,
        Some(Commands::Run(args)) => run(args).await?,
        Some(Commands::Serve { model, host, port }) => cli::serve(model, host, port).await?,
    }

    Ok(())
}

/// Loading and generation block, so they stay off the async workers.
async fn run(args: RunArgs) -> Result<()> {
    tokio::task::spawn_blocking(move || cli::run(args)).await?
}
