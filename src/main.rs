use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herald::config::Config;

mod commands;

use commands::{BroadcastCommand, UserCommand};

#[derive(Parser)]
#[command(
    name = "herald",
    version,
    about = "Broadcast dispatch and notification fan-out engine",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (defaults to HERALD_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Manage the recipient population
    User {
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Author and inspect broadcasts
    Broadcast {
        #[command(subcommand)]
        action: BroadcastCommand,
    },

    /// Dispatch a draft broadcast
    Send {
        /// Broadcast id
        #[arg(long)]
        id: i64,

        /// Calling user (must own the broadcast)
        #[arg(long)]
        caller: i64,

        /// Comma separated recipient ids (default: every active user but the owner)
        #[arg(long)]
        to: Option<String>,

        /// Deadline for the whole dispatch
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print Prometheus metrics after the dispatch
        #[arg(long, default_value = "false")]
        print_metrics: bool,
    },

    /// List a user's notifications
    Inbox {
        /// Recipient id
        #[arg(long)]
        user: i64,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "10")]
        per_page: u32,
    },

    /// Mark a notification as read
    Read {
        /// Notification id
        #[arg(long)]
        notification: i64,

        /// Recipient id
        #[arg(long)]
        user: i64,
    },

    /// Fail broadcasts stuck in sending
    Reap {
        /// Lease age threshold (default: dispatch.lease_ttl_secs)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate()?;

    // Initialize tracing/logging
    setup_tracing(&config.logging.level, &config.logging.format, cli.verbose)?;

    tracing::info!(backend = config.database.backend.as_str(), "herald starting");

    match cli.command {
        Commands::Init => {
            commands::init(&config).await?;
        }

        Commands::User { action } => {
            let storage = commands::open_storage(&config).await?;
            commands::user(&storage, action).await?;
        }

        Commands::Broadcast { action } => {
            let storage = commands::open_storage(&config).await?;
            commands::broadcast(&storage, action).await?;
        }

        Commands::Send {
            id,
            caller,
            to,
            timeout_secs,
            print_metrics,
        } => {
            tracing::info!(
                id = %id,
                caller = %caller,
                to = ?to,
                timeout_secs = ?timeout_secs,
                "Starting send command"
            );
            commands::send(
                &config,
                commands::SendParams {
                    id,
                    caller,
                    to,
                    timeout_secs,
                    print_metrics,
                },
            )
            .await?;
        }

        Commands::Inbox {
            user,
            page,
            per_page,
        } => {
            let storage = commands::open_storage(&config).await?;
            commands::inbox(&storage, user, page, per_page).await?;
        }

        Commands::Read { notification, user } => {
            let storage = commands::open_storage(&config).await?;
            commands::read(&storage, notification, user).await?;
        }

        Commands::Reap { older_than_secs } => {
            commands::reap(&config, older_than_secs).await?;
        }
    }

    tracing::info!("herald completed successfully");
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Config::from_env(),
    }
}

fn setup_tracing(level: &str, format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("herald=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("herald={level},warn"))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
