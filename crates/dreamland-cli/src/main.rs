//! dreamland - Dreamland framework manager
//!
//! Installs the Dreamland hooking framework and manages which apps and
//! modules it is enabled for.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dreamland_core::ManagerConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// dreamland - Dreamland framework manager
#[derive(Parser, Debug)]
#[command(name = "dreamland")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used if it does not exist)
    #[arg(short, long, default_value = "dreamland.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Environment ===
    /// Show SELinux state
    Selinux {
        /// Also show the security context of this file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    // === Installation ===
    /// Install the framework
    Install {
        /// Print observer events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show framework status
    Status,

    // === Activation ===
    /// List tracked apps and modules
    #[command(alias = "ls")]
    List,

    /// Track an app or module
    Track {
        /// Package identifier
        identifier: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// Track as a module instead of an app
        #[arg(long)]
        module: bool,

        /// The module cannot be enabled on this device
        #[arg(long, requires = "module")]
        unsupported: bool,
    },

    /// Enable hooks for an app or module
    Enable {
        /// Package identifier
        identifier: String,
    },

    /// Disable hooks for an app or module
    Disable {
        /// Package identifier
        identifier: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ManagerConfig::from_file_or_default(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Selinux { file, json } => commands::selinux::show(&config, file.as_deref(), json),
        Commands::Install { json } => commands::install::run(config, json),
        Commands::Status => commands::activation::status(config),
        Commands::List => commands::activation::list(config),
        Commands::Track {
            identifier,
            name,
            module,
            unsupported,
        } => commands::activation::track(config, &identifier, &name, module, !unsupported),
        Commands::Enable { identifier } => commands::activation::set(config, &identifier, true),
        Commands::Disable { identifier } => commands::activation::set(config, &identifier, false),
    }
}
