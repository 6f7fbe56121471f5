//! ThreatNet coordinator - federated threat-intelligence exchange
//!
//! This binary provides:
//! - The bidirectional client event channel (WebSocket) and HTTP API
//! - Trust-weighted IOC consensus and verification broadcasts
//! - Periodic trust decay, IOC expiry, and heartbeat reaping

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use threatnet_coordinator::config::Config;
use threatnet_coordinator::server;
use threatnet_coordinator::storage::Storage;

#[derive(Parser)]
#[command(name = "threatnet-coordinator")]
#[command(version, about = "ThreatNet federated threat-intelligence coordinator", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "coordinator.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator service
    Run,

    /// Show store statistics
    Status,

    /// Initialize the database
    InitDb {
        /// Database URL
        #[arg(long, default_value = "sqlite://threatnet.db")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_logging(cli.debug, &config)?;

    info!("ThreatNet coordinator starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => server::run_with_config(config).await?,
        Commands::Status => show_status(&config).await?,
        Commands::InitDb { database_url } => init_database(&database_url).await?,
    }

    Ok(())
}

/// Load the configuration file, falling back to defaults when it is absent.
fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        eprintln!("Config file {} not found, using defaults", path);
        Ok(Config::default())
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool, config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("threatnet_coordinator=debug,tower_http=debug,sqlx=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "threatnet_coordinator={},tower_http=info",
                config.logging.level
            ))
        })
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }

    Ok(())
}

/// Show store statistics
async fn show_status(config: &Config) -> Result<()> {
    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await
    .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    let stats = storage.stats().await?;

    println!("\n=== ThreatNet Coordinator Status ===\n");
    println!("IOCs:");
    println!("  Total: {}", stats.total_iocs);
    println!("  Verified: {}", stats.verified_iocs);
    println!("  Pending: {}", stats.pending_iocs);
    println!("  Expired: {}", stats.expired_iocs);
    println!("\nClients:");
    println!("  Known: {}", stats.total_clients);
    println!("  Average trust: {:.3}", stats.average_trust);
    println!();

    storage.close().await;

    Ok(())
}

/// Initialize the database
async fn init_database(database_url: &str) -> Result<()> {
    info!("Initializing database: {}", database_url);

    let storage = Storage::new(database_url, None, None)
        .await
        .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    storage
        .health_check()
        .await
        .context("Database health check failed")?;

    let stats = storage.stats().await?;
    info!("Database initialized successfully!");
    info!("  IOCs: {}", stats.total_iocs);
    info!("  Clients: {}", stats.total_clients);

    storage.close().await;

    Ok(())
}
