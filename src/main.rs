//! treeircd - main binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use treeircd_core::{Config, Server};

/// A spanning-tree IRC daemon
#[derive(Parser)]
#[command(name = "treeircd")]
#[command(about = "A spanning-tree IRC daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "treeircd.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Test configuration and exit
    #[arg(long)]
    test_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "treeircd.toml")]
        output: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    if let Some(command) = cli.command {
        match command {
            Commands::Config { output } => {
                let config = Config::default();
                config.to_file(&output)?;
                println!("Generated default configuration file: {:?}", output);
                return Ok(());
            }
            Commands::Version => {
                println!("treeircd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
        }
    }

    let config = if cli.config.exists() {
        info!("Loading configuration from {:?}", cli.config);
        Config::from_file(&cli.config)?
    } else {
        info!("Configuration file not found, using defaults");
        Config::default()
    };

    if cli.test_config {
        config.validate()?;
        info!("Configuration is valid");
        return Ok(());
    }

    let mut server = Server::new(config);
    server.init().await?;

    info!("Starting treeircd...");
    server.run().await?;
    Ok(())
}

fn init_logging(level: &str) {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();
}
