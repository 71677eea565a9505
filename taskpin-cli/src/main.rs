//! Taskpin CLI: runs the homework bridge and its maintenance commands.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use taskpin_core::config::ConfigOverrides;
use taskpin_core::tasks::Locale;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Taskpin: keeps a pinned homework dashboard in sync and turns chat into tasks
#[derive(Parser, Debug)]
#[command(name = "taskpin", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (looked up for `.taskpin/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of the monitored chat channel
    #[arg(long)]
    channel: Option<String>,

    /// Title of the task list to mirror
    #[arg(long)]
    list: Option<String>,

    /// Dashboard language: en or de
    #[arg(long)]
    locale: Option<Locale>,

    /// Seconds between dashboard syncs
    #[arg(long)]
    interval: Option<u64>,

    /// LLM model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            channel_name: self.channel.clone(),
            list_title: self.list.clone(),
            locale: self.locale,
            interval_secs: self.interval,
            model: self.model.clone(),
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the bridge: dashboard sync, chat handler, and health server
    Run,
    /// Run one dashboard sync cycle and print the outcome
    SyncOnce,
    /// Send one utterance through the agent and print the reply
    Ask {
        /// What to ask, e.g. "Math worksheet due Friday"
        utterance: String,
    },
    /// Manage the task-list login
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum AuthAction {
    /// Log in through the browser and store the refresh token
    Login {
        /// Seconds to wait for the browser callback
        #[arg(long, default_value = "300")]
        timeout: u64,
    },
    /// Show which credential source is configured and whether a token is stored
    Status,
    /// Remove the stored refresh token
    Logout,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr; RUST_LOG wins when set.
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    // JSON file layer for structured logging
    let log_dir = taskpin_core::config::log_dir().unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "taskpin.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let overrides = cli.overrides();
    commands::handle_command(cli.command, &workspace, cli.config.as_deref(), &overrides).await
}
