mod editor;

use std::time::Duration;

use clap::{Parser, Subcommand};
use coedit_collab::client::{LinkConfig, ReconnectPolicy};
use coedit_collab::server::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "coedit", version, about = "Real-time shared-document sync over WebSocket")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync server
    Server {
        /// Address to bind (e.g. 0.0.0.0:3000)
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
        /// Document content at startup
        #[arg(long)]
        initial_content: Option<String>,
        /// Frames buffered per connection before updates are dropped
        #[arg(long, default_value_t = 256, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
        outbound_capacity: usize,
    },
    /// Run an interactive line editor linked to a server
    Client {
        /// Server WebSocket URL
        #[arg(long, default_value = "ws://localhost:3000")]
        url: String,
        /// User label attached to edits
        #[arg(long)]
        user: Option<String>,
        /// Delay before reconnecting, in milliseconds
        #[arg(long, default_value_t = 1000)]
        retry_ms: u64,
        /// Back off exponentially up to this many milliseconds
        #[arg(long)]
        max_retry_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Server {
            addr,
            initial_content,
            outbound_capacity,
        } => {
            let mut config = ServerConfig {
                bind_addr: addr,
                outbound_capacity,
                ..ServerConfig::default()
            };
            if let Some(content) = initial_content {
                config.initial_content = content;
            }
            log::info!("Starting sync server on {}", config.bind_addr);
            SyncServer::new(config).run().await?;
        }
        Command::Client {
            url,
            user,
            retry_ms,
            max_retry_ms,
        } => {
            let initial = Duration::from_millis(retry_ms);
            let reconnect = match max_retry_ms {
                Some(max) => ReconnectPolicy::Exponential {
                    initial,
                    max: Duration::from_millis(max),
                },
                None => ReconnectPolicy::Fixed(initial),
            };
            let config = LinkConfig {
                server_url: url,
                reconnect,
                ..LinkConfig::default()
            };
            editor::run(config, user.unwrap_or_default()).await?;
        }
    }

    Ok(())
}
