//! pollcall - peer-to-peer calls over a polled session store
//!
//! A terminal client for placing and answering voice and video calls.

mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pollcall::config::Config;

#[derive(Parser)]
#[command(name = "pollcall")]
#[command(about = "Peer-to-peer voice and video calls over a session store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the platform default
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the local identity and store settings to the config file
    Init {
        /// Identity to call and answer as
        identity: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Base URL of the call session store
        #[arg(long)]
        store_url: Option<String>,

        /// Bearer token for the store
        #[arg(long)]
        token: Option<String>,
    },

    /// Show the effective configuration
    Config,

    /// Call a peer
    Call {
        /// Identity of the peer to call
        peer: String,

        /// Place a video call instead of a voice call
        #[arg(long)]
        video: bool,

        /// Display name for the peer
        #[arg(short, long)]
        name: Option<String>,

        /// Seconds to keep the call up once connected
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept every incoming call
        #[arg(long)]
        auto_accept: bool,

        /// Decline every incoming call
        #[arg(long)]
        decline_all: bool,
    },

    /// Run a call between two in-process endpoints
    Demo {
        /// Place a video call
        #[arg(long)]
        video: bool,

        /// Have the callee decline
        #[arg(long)]
        decline: bool,
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

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    match cli.command {
        Commands::Init {
            identity,
            name,
            store_url,
            token,
        } => {
            cli::init(&config_path, identity, name, store_url, token)?;
        }
        Commands::Config => {
            cli::show_config(&config_path)?;
        }
        Commands::Call {
            peer,
            video,
            name,
            duration,
        } => {
            tracing::info!("Calling {}...", peer);
            cli::call(&config_path, peer, video, name, duration).await?;
        }
        Commands::Listen {
            auto_accept,
            decline_all,
        } => {
            cli::listen(&config_path, auto_accept, decline_all).await?;
        }
        Commands::Demo { video, decline } => {
            cli::demo(video, decline).await?;
        }
    }

    Ok(())
}
