//! Peer-Pool: the peer connection manager of a blockchain node
//!
//! This crate keeps a node attached to the rest of the network:
//! - Seed peers dialed on a fixed reconnect schedule
//! - Inbound connections spliced in from a listener
//! - Version handshake (network magic, self-connection detection)
//! - A receive pump dispatching every message to subscribers
//! - Broadcast of protocol messages to all connected peers
//!
//! # Example
//!
//! ```rust,no_run
//! use peer_pool::network::{ConnectionPool, Message, TcpChannelFactory, TcpInbound};
//! use peer_pool::node::LocalNode;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpInbound::bind("0.0.0.0:8333").await?;
//! let local = Arc::new(LocalNode::new("example/0.1"));
//! let seeds = vec!["10.0.0.1:8333".to_string()];
//!
//! let pool = ConnectionPool::new(local, 0x5045_4552, &seeds, Arc::new(TcpChannelFactory), &listener);
//! pool.start().await?;
//!
//! let report = pool.broadcast(&Message::Ping(1)).await;
//! println!("Pinged {} peer(s)", report.delivered.len());
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod network;
pub mod node;

// Re-export commonly used types
pub use chain::{BlockHead, ChainTip};
pub use config::{ConfigError, PoolConfig, PoolTimings, DEFAULT_MAGIC};
pub use network::{
    BroadcastReport, ConnectionPool, ConnectionStatus, Message, PeerAddress, PoolError,
    ReceivedMessage,
};
pub use node::{LocalNode, NodeId};
