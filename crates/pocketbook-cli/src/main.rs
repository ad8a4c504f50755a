//! Pocketbook CLI
//!
//! Command-line host for Pocketbook cloud sync: login, one-shot pull/push,
//! and a long-running sync loop over the device's local store.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pocketbook_core::{Config, SyncContext};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "pocketbook")]
#[command(about = "Pocketbook - personal finance data, synced across devices")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with an email link
    Login {
        /// Email address to send the login link to
        #[arg(long, conflicts_with = "token", required_unless_present = "token")]
        email: Option<String>,
        /// Access token from the emailed link
        #[arg(long)]
        token: Option<String>,
        /// Refresh token from the emailed link (keeps the session alive)
        #[arg(long, requires = "token")]
        refresh_token: Option<String>,
    },
    /// Sign out and stop syncing
    Logout,
    /// Show identity, backend and sync settings
    Status,
    /// Pull the remote snapshot into the local store
    Pull,
    /// Push the local snapshot to the remote store
    Push,
    /// Pull, then push (one bootstrap pass)
    Sync,
    /// Keep syncing until interrupted
    Run,
    /// Read a local store value
    Get {
        /// Local store key
        key: String,
    },
    /// Write a local store value
    Set {
        /// Local store key
        key: String,
        /// Value (usually JSON text)
        value: String,
    },
    /// List the synced keys and whether they are set locally
    Keys,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, remote_db, ...)
        key: String,
        /// Configuration value ("none" clears optional values)
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work even with a broken data dir
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    let context = SyncContext::open_with_config(config)?;

    match cli.command {
        Commands::Login {
            email,
            token,
            refresh_token,
        } => commands::auth::login(&context, email, token, refresh_token, &output).await,
        Commands::Logout => commands::auth::logout(&context, &output).await,
        Commands::Status => commands::status::show(&context, &output),
        Commands::Pull => commands::sync::pull(&context, &output).await,
        Commands::Push => commands::sync::push(&context, &output).await,
        Commands::Sync => commands::sync::sync(&context, &output).await,
        Commands::Run => commands::sync::run(&context, &output).await,
        Commands::Get { key } => commands::store::get(&context, key, &output),
        Commands::Set { key, value } => commands::store::set(&context, key, value, &output),
        Commands::Keys => commands::store::keys(&context, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

/// Initialize logging
///
/// Only initializes if POCKETBOOK_LOG is set. Logs go to `log_file` when
/// configured, otherwise stderr.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("POCKETBOOK_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "pocketbook_core={},pocketbook_cli={}",
        log_level, log_level
    ));

    match config.log_file {
        Some(ref log_path) => {
            let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
                    return;
                }
            };

            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_file)
                .try_init();

            info!("Logging to {:?}", log_path);
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
