//! ride-call - in-trip rider/driver calls
//!
//! Runs the signaling relay, or one side of a trip call from the terminal.

mod calling;
mod config;
mod signaling;
mod trip;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calling::runner::{self, CallOptions};
use config::Config;

#[derive(Parser)]
#[command(name = "ride-call")]
#[command(about = "Rider/driver calls for an active trip", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct TripArgs {
    /// Trip ID; both parties must use the same one
    #[arg(long)]
    trip: String,

    /// Rider user ID
    #[arg(long)]
    rider: String,

    /// Driver user ID
    #[arg(long)]
    driver: String,

    /// Who you are (rider or driver ID); defaults to the configured identity
    #[arg(long = "as")]
    user: Option<String>,

    /// Hang up this many seconds after connecting
    #[arg(short, long)]
    duration: Option<u64>,
}

impl From<TripArgs> for CallOptions {
    fn from(args: TripArgs) -> Self {
        CallOptions {
            trip_id: args.trip,
            rider_id: args.rider,
            driver_id: args.driver,
            user_id: args.user,
            duration: args.duration,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8787")]
        listen: String,
    },

    /// Wait for the trip counterpart to call and answer
    Listen(TripArgs),

    /// Call the trip counterpart
    Call(TripArgs),

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Relay { listen } => {
            tracing::info!("Starting signaling relay...");
            signaling::relay::run(&listen).await?;
        }
        Commands::Listen(args) => {
            runner::listen(args.into(), &config).await?;
        }
        Commands::Call(args) => {
            runner::call(args.into(), &config).await?;
        }
        Commands::Config { init } => {
            if init {
                let path = match &cli.config {
                    Some(path) => {
                        config.save_to(path)?;
                        path.clone()
                    }
                    None => config.save()?,
                };
                println!("Wrote {}", path.display());
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
