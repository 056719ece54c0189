use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{open_context, ConfigCommand, DemoCommand, RowCommand, SyncCommand};
use config::Config;

#[derive(Parser)]
#[command(name = "tablesync")]
#[command(version)]
#[command(about = "Offline-first table sync CLI", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read and edit rows in the local store
    Row(RowCommand),

    /// Push, pull and inspect the operation queue
    Sync(SyncCommand),

    /// Insert, edit and push a sample row
    Demo(DemoCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    // Logs go to stderr so command output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tablesync=info,tablesync_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Row(cmd)) => {
            let ctx = open_context(&config).await?;
            cmd.run(&ctx, &config).await?;
        }
        Some(Commands::Sync(cmd)) => {
            let ctx = open_context(&config).await?;
            cmd.run(&ctx, &config).await?;
        }
        Some(Commands::Demo(cmd)) => {
            let ctx = open_context(&config).await?;
            cmd.run(&ctx, &config).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
