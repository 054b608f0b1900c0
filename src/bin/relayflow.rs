use clap::{command, Parser};
use relayflow::{config::SystemConfig, system::System, Error};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "relayflow.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let config = if cli.config.exists() {
        SystemConfig::from_file(&cli.config)?
    } else {
        info!("{} not found, using defaults", cli.config.display());
        SystemConfig::default()
    };
    debug!("config: {:?}", config);

    let system = System::new(config)?;
    system.apply_definitions().await?;
    system.start().await;

    println!("relayflow started. Press Ctrl+C to shutdown.");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::internal(format!("Failed to wait for Ctrl+C: {}", e)))?;

    println!("Shutdown signal received, performing clean shutdown...");
    system.shutdown().await?;
    println!("Shutdown completed.");

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {} ({})", e, e.code());
        std::process::exit(1);
    }
}
