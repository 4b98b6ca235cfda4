//! Peer-Pool CLI Application
//!
//! Runs a connection pool over TCP for manual testing of a peer network.

use clap::{Parser, Subcommand};
use peer_pool::config::PoolConfig;
use peer_pool::network::{ConnectionPool, Message, TcpChannelFactory, TcpInbound};
use peer_pool::node::LocalNode;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "peer-pool")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer connection pool for a blockchain node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node that only maintains peer connections
    Run {
        /// Configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on (overrides the config file)
        #[arg(short, long)]
        listen: Option<String>,

        /// Seed peers to connect to (comma-separated)
        #[arg(long)]
        seeds: Option<String>,

        /// Network magic number
        #[arg(long)]
        magic: Option<u32>,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            listen,
            seeds,
            magic,
        } => {
            let mut pool_config = match config {
                Some(path) => PoolConfig::load(path)?,
                None => PoolConfig::default(),
            };
            if let Some(listen) = listen {
                pool_config.listen_address = listen;
            }
            if let Some(seeds) = seeds {
                pool_config.seeds = seeds
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(magic) = magic {
                pool_config.magic = magic;
            }
            pool_config.validate()?;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(pool_config))
                .map_err(|e| -> Box<dyn std::error::Error> { e })?;
        }

        Commands::InitConfig { output } => {
            PoolConfig::default().save(&output)?;
            println!("✅ Wrote default configuration to {}", output.display());
        }
    }

    Ok(())
}

async fn run(config: PoolConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpInbound::bind(&config.listen_address).await?;
    let local = Arc::new(LocalNode::new(config.user_agent.clone()));

    println!("🌐 Node {} listening on {}", local.id(), listener.local_addr());
    println!("   Seeds: {}", config.seeds.join(", "));

    let pool = ConnectionPool::from_config(local, &config, Arc::new(TcpChannelFactory), &listener);
    pool.start().await?;

    // Log everything the pump receives
    let mut messages = pool.subscribe();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(received) => log::info!(
                    "{} from {} ({})",
                    received.message.type_name(),
                    received.from,
                    received
                        .remote
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".to_string())
                ),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Message log fell behind, skipped {}", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut heartbeat = tokio::time::interval(config.timings.reconnect_period());
    let mut nonce: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n📴 Shutting down...");
                break;
            }
            _ = heartbeat.tick() => {
                nonce += 1;
                let report = pool.broadcast(&Message::Ping(nonce)).await;
                log::info!(
                    "Connected peers: {}, ping delivered to {}, failed {}",
                    pool.connected_count().await,
                    report.delivered.len(),
                    report.failed.len()
                );
            }
        }
    }

    pool.shutdown().await;
    Ok(())
}
