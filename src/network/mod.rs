//! P2P connection management
//!
//! Keeps a node connected to its peers.
//!
//! # Features
//! - Seed peers dialed and re-dialed on a fixed schedule
//! - Inbound connections adopted from a listener
//! - Version handshake with network and self-connection checks
//! - Continuous receive pump with subscriber fan-out
//! - Broadcast to every connected peer
//! - TCP and in-process transports

pub mod channel;
pub mod memory;
pub mod message;
pub mod pool;
pub mod record;
pub mod tcp;

pub use channel::{ChannelError, ChannelFactory, InboundListener, PeerChannel, SharedChannel};
pub use memory::{MemoryChannel, MemoryChannelFactory, MemoryListener, MemoryNetwork};
pub use message::{Message, VersionInfo, FRAME_MARKER, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use pool::{BroadcastReport, ConnectionPool, PoolError, ReceivedMessage};
pub use record::{
    ConnectionRecord, ConnectionStatus, PeerAddress, RecordHandle, RecordSnapshot,
};
pub use tcp::{MessageCodec, TcpChannel, TcpChannelFactory, TcpInbound};
