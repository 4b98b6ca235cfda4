//! Connection records
//!
//! One record per known peer: where to reach it, how far the connection got,
//! what the peer told us about itself, and the live channel if any.

use crate::chain::BlockHead;
use crate::network::channel::SharedChannel;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where a peer can be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddress {
    /// A seed address the sweep may dial
    Dialable(String),
    /// Accepted from the listener; only a new inbound connection revives it
    Inbound,
}

impl PeerAddress {
    pub fn is_inbound(&self) -> bool {
        matches!(self, PeerAddress::Inbound)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Dialable(addr) => f.write_str(addr),
            PeerAddress::Inbound => f.write_str("inbound"),
        }
    }
}

/// Connection state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Never attempted
    Initial,
    /// The peer turned out to be this node
    SelfConnection,
    /// The peer speaks another network magic
    DifferentNetwork,
    /// Handshake completed, channel live
    Connected,
    /// Inbound peer went away
    Disconnected,
    /// Last dial failed; retried by the sweep
    Dead,
}

impl ConnectionStatus {
    /// Statuses the reconnect sweep picks up
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionStatus::Initial | ConnectionStatus::Dead)
    }
}

/// State held for one peer
pub struct ConnectionRecord {
    pub address: PeerAddress,
    pub status: ConnectionStatus,
    /// Filled in by the handshake
    pub node_id: Option<NodeId>,
    /// Present while a connection to the peer is adopted
    pub channel: Option<SharedChannel>,
    pub latest_head: Option<BlockHead>,
    pub latest_height: u64,
    /// Last time a message arrived from this peer
    pub last_seen: Option<DateTime<Utc>>,
    /// Dial attempts made by the reconnect sweep
    pub connect_attempts: u32,
    pub(crate) dialing: bool,
}

/// Shared, individually locked record
pub type RecordHandle = Arc<RwLock<ConnectionRecord>>;

impl ConnectionRecord {
    /// A seed peer, not yet contacted
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_address(PeerAddress::Dialable(address.into()))
    }

    /// A peer that connected to us over `channel`
    pub fn inbound(channel: SharedChannel) -> Self {
        let mut record = Self::with_address(PeerAddress::Inbound);
        record.channel = Some(channel);
        record
    }

    fn with_address(address: PeerAddress) -> Self {
        Self {
            address,
            status: ConnectionStatus::Initial,
            node_id: None,
            channel: None,
            latest_head: None,
            latest_height: 0,
            last_seen: None,
            connect_attempts: 0,
            dialing: false,
        }
    }

    pub fn into_handle(self) -> RecordHandle {
        Arc::new(RwLock::new(self))
    }

    /// `(local, remote)` endpoints of the attached channel
    pub fn endpoints(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.channel.as_ref().and_then(|c| c.endpoints())
    }

    /// Human-readable label for logs
    pub fn label(&self) -> String {
        match (&self.address, self.endpoints()) {
            (PeerAddress::Inbound, Some((_, remote))) => format!("inbound {}", remote),
            (address, _) => address.to_string(),
        }
    }

    /// Detach the channel if it is still `channel`
    pub fn detach(&mut self, channel: &SharedChannel) -> bool {
        match &self.channel {
            Some(current) if Arc::ptr_eq(current, channel) => {
                self.channel = None;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            address: self.address.clone(),
            status: self.status,
            node_id: self.node_id,
            has_channel: self.channel.is_some(),
            endpoints: self.endpoints(),
            latest_head: self.latest_head.clone(),
            latest_height: self.latest_height,
            last_seen: self.last_seen,
            connect_attempts: self.connect_attempts,
        }
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("address", &self.address)
            .field("status", &self.status)
            .field("node_id", &self.node_id)
            .field("endpoints", &self.endpoints())
            .field("latest_height", &self.latest_height)
            .finish()
    }
}

/// Read-only copy of a record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub address: PeerAddress,
    pub status: ConnectionStatus,
    pub node_id: Option<NodeId>,
    pub has_channel: bool,
    pub endpoints: Option<(SocketAddr, SocketAddr)>,
    pub latest_head: Option<BlockHead>,
    pub latest_height: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub connect_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record() {
        let record = ConnectionRecord::new("10.0.0.1:9000");
        assert_eq!(
            record.address,
            PeerAddress::Dialable("10.0.0.1:9000".to_string())
        );
        assert_eq!(record.status, ConnectionStatus::Initial);
        assert!(record.channel.is_none());
        assert!(record.node_id.is_none());
        assert_eq!(record.label(), "10.0.0.1:9000");
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(ConnectionStatus::Initial.is_retryable());
        assert!(ConnectionStatus::Dead.is_retryable());
        assert!(!ConnectionStatus::Connected.is_retryable());
        assert!(!ConnectionStatus::SelfConnection.is_retryable());
        assert!(!ConnectionStatus::DifferentNetwork.is_retryable());
        assert!(!ConnectionStatus::Disconnected.is_retryable());
    }

    #[test]
    fn test_inbound_address() {
        assert!(PeerAddress::Inbound.is_inbound());
        assert!(!PeerAddress::Dialable("a".into()).is_inbound());
        assert_eq!(PeerAddress::Inbound.to_string(), "inbound");
    }
}
