//! Tether Daemon
//!
//! Headless service hosting resumable sessions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::{EchoHandler, SessionServer};

/// Tether daemon - session server that survives transport drops.
#[derive(Parser, Debug)]
#[command(name = "tetherd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the Tether daemon
    Start {
        /// Listen address override (e.g. 0.0.0.0:2567)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing; --verbose wins over the configured level
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Start { listen } => {
            if let Some(addr) = listen {
                config.server.listen_addr = addr;
            }
            config.validate()?;

            tracing::info!("Tether daemon starting...");
            run_server(&config).await?;
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Init { force } => {
                let path = cli.config.unwrap_or_else(default_config_path);
                if path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists at {} (use --force to overwrite)",
                        path.display()
                    );
                }
                Config::default().save(&path)?;
                println!("Wrote default configuration to {}", path.display());
            }
            ConfigCommands::Show => {
                config.validate()?;
                print!("{}", config.to_toml()?);
            }
        },
    }

    Ok(())
}

/// Run the session server until a shutdown signal arrives.
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let server = SessionServer::bind(
        &config.server.listen_addr,
        EchoHandler,
        config.server_options(),
    )
    .await?;

    let cancel = server.cancellation_token();

    // Trigger cooperative shutdown on SIGTERM or SIGINT
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        cancel.cancel();
    });

    server.run().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
