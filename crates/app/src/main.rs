//! Huddle - password-protected chat rooms without a room server
//!
//! Participants find each other through a relay broker, elect a hub per room
//! and then talk over direct peer channels.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod chat;
mod demo;
mod state;

#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Room chat over a self-organizing peer mesh")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay broker that hands out identities and relays channels
    Broker {
        /// Port to listen on
        #[arg(long, default_value_t = huddle_net::DEFAULT_PORT)]
        port: u16,
    },

    /// Join a room and chat from the terminal
    Join {
        /// Room name
        #[arg(long)]
        room: String,
        /// Three-digit room password
        #[arg(long)]
        password: String,
        /// Display name (a random dish name when omitted)
        #[arg(long)]
        name: Option<String>,
        /// Broker address, overrides the config file
        #[arg(long)]
        broker: Option<String>,
        /// Config file (defaults to the platform config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run several participants in one process over an in-memory network
    Demo {
        /// Number of participants
        #[arg(long, default_value_t = 3)]
        peers: usize,
        /// Room name (random when omitted)
        #[arg(long)]
        room: Option<String>,
        /// Three-digit room password
        #[arg(long, default_value = "000")]
        password: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Broker { port } => run_broker(port).await,
        Command::Join {
            room,
            password,
            name,
            broker,
            config,
        } => {
            let config = match config {
                Some(path) => huddle_core::SessionConfig::load(&path)
                    .with_context(|| format!("Failed to load config from {}", path.display()))?,
                None => huddle_core::SessionConfig::load_default().context("Failed to load config")?,
            };
            chat::run(chat::JoinOptions {
                room,
                password,
                name,
                broker,
                config,
            })
            .await
        }
        Command::Demo {
            peers,
            room,
            password,
        } => demo::run(peers, room, password).await,
    }
}

async fn run_broker(port: u16) -> Result<()> {
    let broker = huddle_net::Broker::start(port)
        .await
        .with_context(|| format!("Failed to start broker on port {}", port))?;
    println!("Broker listening on {}", broker.addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    broker.shutdown();
    Ok(())
}
