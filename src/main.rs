use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Family Rewards
///
/// Earn-and-spend screen time: children collect points from time spent in
/// learning apps and redeem them for time-boxed access to reward apps.
#[derive(Parser, Debug)]
#[command(name = "family-rewards")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "rewards-config.yaml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write an example configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show balances, today's accrual, and active reward windows
    Status {
        /// Limit output to one child
        #[arg(long)]
        child: Option<String>,
    },
    /// Record a finished learning-app session and award its points
    Accrue {
        #[arg(long)]
        child: String,

        /// App the usage happened in
        #[arg(long)]
        app: Option<String>,

        /// Session start (RFC 3339)
        #[arg(long)]
        started: String,

        /// Last detected activity (RFC 3339)
        #[arg(long)]
        last_activity: String,

        /// Session end (RFC 3339); defaults to now
        #[arg(long)]
        ended: Option<String>,
    },
    /// Spend points on a reward-time window
    Redeem {
        #[arg(long)]
        child: String,

        #[arg(long)]
        points: i64,

        /// Spend from an app-scoped balance
        #[arg(long)]
        app: Option<String>,
    },
    /// Manually adjust a child's balance
    Adjust {
        #[arg(long)]
        child: String,

        /// Signed point amount
        #[arg(long, allow_hyphen_values = true)]
        points: i64,

        #[arg(long)]
        reason: String,

        #[arg(long)]
        app: Option<String>,
    },
    /// Show recent ledger entries and the audit trail
    History {
        #[arg(long)]
        child: String,

        /// Number of entries to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Pairing-code management
    Pair {
        #[command(subcommand)]
        command: PairCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PairCommands {
    /// Generate a pairing code for a child
    Generate {
        #[arg(long)]
        child: String,

        /// Minutes before the code expires
        #[arg(long, default_value = "10")]
        ttl_minutes: i64,
    },
    /// Consume a pairing code on a device
    Consume {
        #[arg(long)]
        code: String,

        #[arg(long)]
        device: String,
    },
    /// Show the pairing for a device
    Show {
        #[arg(long)]
        device: String,
    },
    /// Revoke a device's pairing
    Revoke {
        #[arg(long)]
        device: String,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(args))
}

async fn dispatch(args: Args) -> Result<()> {
    let config = args.config.as_path();
    match args.command {
        Commands::Init { force } => commands::rewards::init(config, force),
        Commands::Status { child } => commands::rewards::status(config, child.as_deref()).await,
        Commands::Accrue {
            child,
            app,
            started,
            last_activity,
            ended,
        } => {
            commands::rewards::accrue(
                config,
                &child,
                app.as_deref(),
                &started,
                &last_activity,
                ended.as_deref(),
            )
            .await
        }
        Commands::Redeem { child, points, app } => {
            commands::rewards::redeem(config, &child, points, app.as_deref()).await
        }
        Commands::Adjust {
            child,
            points,
            reason,
            app,
        } => commands::rewards::adjust(config, &child, points, &reason, app.as_deref()).await,
        Commands::History { child, limit } => {
            commands::rewards::history(config, &child, limit).await
        }
        Commands::Pair { command } => match command {
            PairCommands::Generate { child, ttl_minutes } => {
                commands::rewards::pair_generate(config, &child, ttl_minutes).await
            }
            PairCommands::Consume { code, device } => {
                commands::rewards::pair_consume(config, &code, &device).await
            }
            PairCommands::Show { device } => commands::rewards::pair_show(config, &device).await,
            PairCommands::Revoke { device } => {
                commands::rewards::pair_revoke(config, &device).await
            }
        },
    }
}

/// Initialize logging
fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}
