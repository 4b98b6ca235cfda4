//! Transport capabilities consumed by the connection pool
//!
//! The pool never touches sockets directly. It drives peers through
//! [`PeerChannel`], obtains fresh channels from a [`ChannelFactory`] and
//! learns about accepted connections from an [`InboundListener`].

use crate::network::message::Message;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Channel closed")]
    Closed,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Channel not connected")]
    NotConnected,
    #[error("Channel already connected")]
    AlreadyConnected,
}

/// A single bidirectional connection to a peer
///
/// All methods take `&self` so that the receive pump and a broadcast can use
/// the same channel at the same time. Resources are released when the last
/// handle is dropped.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Dial `address`. Only valid on a fresh channel.
    async fn connect(&self, address: &str) -> Result<(), ChannelError>;

    /// Whether the underlying connection is still usable
    fn is_live(&self) -> bool;

    async fn send(&self, message: &Message) -> Result<(), ChannelError>;

    /// Wait for the next message.
    ///
    /// `Ok(None)` means nothing can be read: the peer went away and the
    /// channel now reports not live.
    async fn receive(&self) -> Result<Option<Message>, ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;

    fn local_endpoint(&self) -> Option<SocketAddr>;

    fn remote_endpoint(&self) -> Option<SocketAddr>;

    /// `(local, remote)` pair identifying the physical connection
    fn endpoints(&self) -> Option<(SocketAddr, SocketAddr)> {
        Some((self.local_endpoint()?, self.remote_endpoint()?))
    }
}

/// Shared handle to a channel
pub type SharedChannel = Arc<dyn PeerChannel>;

/// Produces fresh, unconnected channels for outbound dials
pub trait ChannelFactory: Send + Sync {
    fn produce(&self) -> SharedChannel;
}

/// Source of already-connected inbound channels
pub trait InboundListener: Send + Sync {
    /// Address the listener is bound to, as configured
    fn address(&self) -> String;

    /// Stream of newly accepted connections
    fn subscribe(&self) -> mpsc::Receiver<SharedChannel>;
}

/// Close a channel, logging instead of failing.
///
/// A close that makes no progress within `limit` is abandoned.
pub async fn close_quietly(channel: &SharedChannel, peer: &str, limit: Duration) {
    match tokio::time::timeout(limit, channel.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Failed to close channel to {}: {}", peer, e),
        Err(_) => log::warn!("Gave up closing channel to {} after {:?}", peer, limit),
    }
}
