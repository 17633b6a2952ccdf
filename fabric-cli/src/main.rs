//! Fabric CLI - controller and link tooling for the fabric control plane.

mod commands;
mod config;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{FileConfig, LogConfig};
use logging::{init_tracing, verbosity_filter, LogFormat};
use std::path::{Path, PathBuf};

/// Fabric control plane.
#[derive(Parser)]
#[command(name = "fabric")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "fabric.yml")]
    config: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a controller
    Run,

    /// Reset the cluster membership to only this node, then exit
    Recover,

    /// Accept link handshakes from routers
    LinkListen {
        /// Local UDP address
        #[arg(short, long, default_value = "0.0.0.0:6000")]
        bind: String,

        /// Identity token announced in hellos
        #[arg(short, long, default_value = "fabric-router")]
        identity: String,
    },

    /// Dial a router and verify the link
    LinkProbe {
        /// Peer UDP address
        peer: String,

        /// Local UDP address
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: String,

        /// Identity token announced in hellos
        #[arg(short, long, default_value = "fabric-router")]
        identity: String,
    },
}

impl Commands {
    /// Whether the command reads the configuration file.
    fn needs_config(&self) -> bool {
        matches!(self, Commands::Run | Commands::Recover)
    }
}

fn setup_logging(verbosity: u8, log: &LogConfig) -> Result<()> {
    // FABRIC_LOG_FORMAT wins over the file, otherwise auto-detect
    let format = std::env::var("FABRIC_LOG_FORMAT")
        .ok()
        .or_else(|| log.format.clone())
        .and_then(|s| s.parse::<LogFormat>().ok())
        .unwrap_or_else(|| {
            if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
                LogFormat::Pretty
            } else {
                LogFormat::Compact
            }
        });

    let filter = match (verbosity, log.level.as_deref()) {
        (0, Some(level)) => level,
        (v, _) => verbosity_filter(v),
    };

    init_tracing(format, filter)
}

/// Load the configuration file and set up logging from it.
fn load_config(path: &Path, verbosity: u8) -> Result<FileConfig> {
    let config = FileConfig::load(path)?;
    setup_logging(verbosity, &config.log)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Link tooling runs without a configuration file.
    if !cli.command.needs_config() {
        setup_logging(cli.verbose, &LogConfig::default())?;
    }

    match cli.command {
        Commands::Run => {
            let config = load_config(&cli.config, cli.verbose)?;
            commands::run::run(config.raft).await
        }
        Commands::Recover => {
            let config = load_config(&cli.config, cli.verbose)?;
            commands::recover::run(config.raft).await
        }
        Commands::LinkListen { bind, identity } => commands::link::listen(&bind, &identity).await,
        Commands::LinkProbe {
            peer,
            bind,
            identity,
        } => commands::link::probe(&bind, &peer, &identity).await,
    }
}
