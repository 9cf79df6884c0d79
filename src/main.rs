mod cli;
mod commands;

use apkzoo::config::Config;
use apkzoo::observability;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    observability::init_tracing();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Download(args) => commands::download(config, args).await?,
        Commands::Sync(args) => commands::sync(config, args).await?,
        Commands::Search(args) => commands::search(config, args).await?,
        Commands::Metadata(args) => commands::metadata(config, args).await?,
    }

    Ok(())
}
