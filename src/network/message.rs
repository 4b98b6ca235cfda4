//! Network message types for P2P communication
//!
//! Every message knows how to apply itself to the record of the peer that
//! sent it (see [`Message::on_received`]).

use crate::chain::{BlockHead, ChainTip};
use crate::network::record::{ConnectionRecord, ConnectionStatus};
use crate::node::NodeId;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Marker bytes opening every frame on the wire
pub const FRAME_MARKER: [u8; 4] = [0x50, 0x45, 0x45, 0x52]; // "PEER"

/// Largest accepted message body
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Network message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Opening handshake sent by the dialing side
    Version(VersionInfo),

    /// Handshake answer, carrying the responder's own details
    VerAck(VersionInfo),

    /// Keep-alive ping
    Ping(u64),

    /// Keep-alive pong response
    Pong(u64),

    /// Announce a new best block
    NewHead(BlockHead),
}

/// Node details exchanged during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Protocol version
    pub version: u32,
    /// Network magic number
    pub magic: u32,
    /// Identity of the sending node
    pub node_id: NodeId,
    /// Sender's user agent string
    pub user_agent: String,
    /// Sender's chain height
    pub height: u64,
    /// Sender's best block
    pub head: Option<BlockHead>,
}

impl VersionInfo {
    pub fn new(magic: u32, node_id: NodeId, user_agent: impl Into<String>, tip: ChainTip) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            magic,
            node_id,
            user_agent: user_agent.into(),
            height: tip.height,
            head: tip.head,
        }
    }

    /// Status of a peer that introduced itself with these details
    fn judge(&self, local: &VersionInfo) -> ConnectionStatus {
        if self.magic != local.magic {
            ConnectionStatus::DifferentNetwork
        } else if self.node_id == local.node_id {
            ConnectionStatus::SelfConnection
        } else {
            ConnectionStatus::Connected
        }
    }

    fn apply(&self, local: &VersionInfo, record: &mut ConnectionRecord) {
        record.status = self.judge(local);
        match record.status {
            ConnectionStatus::Connected => {
                record.node_id = Some(self.node_id);
                record.latest_height = self.height;
                record.latest_head = self.head.clone();
                log::info!(
                    "Peer {} handshake complete: node={}, height={}, agent={}",
                    record.label(),
                    self.node_id,
                    self.height,
                    self.user_agent
                );
            }
            ConnectionStatus::DifferentNetwork => {
                log::warn!(
                    "Peer {} is on another network (magic {:#x}, ours {:#x})",
                    record.label(),
                    self.magic,
                    local.magic
                );
            }
            ConnectionStatus::SelfConnection => {
                log::info!("Peer {} is ourselves", record.label());
            }
            _ => {}
        }
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Version(_) => "Version",
            Message::VerAck(_) => "VerAck",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::NewHead(_) => "NewHead",
        }
    }

    /// Whether this message completes a handshake
    pub fn is_handshake(&self) -> bool {
        matches!(self, Message::Version(_) | Message::VerAck(_))
    }

    /// Apply this message to the record of the peer that sent it.
    ///
    /// `local` describes this node. Returns the reply to send back to the
    /// peer, if any.
    pub fn on_received(
        &self,
        local: &VersionInfo,
        record: &mut ConnectionRecord,
    ) -> Option<Message> {
        record.last_seen = Some(Utc::now());

        match self {
            Message::Version(info) => {
                info.apply(local, record);
                Some(Message::VerAck(local.clone()))
            }
            Message::VerAck(info) => {
                info.apply(local, record);
                None
            }
            Message::Ping(nonce) => Some(Message::Pong(*nonce)),
            Message::Pong(_) => None,
            Message::NewHead(head) => {
                if head.height >= record.latest_height {
                    record.latest_height = head.height;
                    record.latest_head = Some(head.clone());
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> VersionInfo {
        VersionInfo::new(
            7,
            NodeId::from_bytes([1; 16]),
            "local/1",
            ChainTip::default(),
        )
    }

    fn remote(magic: u32, id: u8, height: u64) -> VersionInfo {
        let head = BlockHead::new("tip", "parent", height);
        VersionInfo::new(magic, NodeId::from_bytes([id; 16]), "remote/1", ChainTip::from_head(head))
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::Ping(12345);
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.type_name(), "Ping");
    }

    #[test]
    fn test_version_promotes_to_connected() {
        let mut record = ConnectionRecord::new("10.0.0.1:9000");
        let reply = Message::Version(remote(7, 2, 12)).on_received(&local(), &mut record);

        assert_eq!(record.status, ConnectionStatus::Connected);
        assert_eq!(record.node_id, Some(NodeId::from_bytes([2; 16])));
        assert_eq!(record.latest_height, 12);
        assert_eq!(record.latest_head.as_ref().unwrap().hash, "tip");
        assert!(record.last_seen.is_some());
        assert_eq!(reply, Some(Message::VerAck(local())));
    }

    #[test]
    fn test_verack_does_not_reply() {
        let mut record = ConnectionRecord::new("10.0.0.1:9000");
        let reply = Message::VerAck(remote(7, 2, 0)).on_received(&local(), &mut record);
        assert!(reply.is_none());
        assert_eq!(record.status, ConnectionStatus::Connected);
    }

    #[test]
    fn test_magic_mismatch_is_different_network() {
        let mut record = ConnectionRecord::new("10.0.0.1:9000");
        Message::VerAck(remote(8, 2, 5)).on_received(&local(), &mut record);
        assert_eq!(record.status, ConnectionStatus::DifferentNetwork);
        assert!(record.node_id.is_none());
        assert_eq!(record.latest_height, 0);
    }

    #[test]
    fn test_own_id_is_self_connection() {
        let mut record = ConnectionRecord::new("10.0.0.1:9000");
        Message::VerAck(remote(7, 1, 5)).on_received(&local(), &mut record);
        assert_eq!(record.status, ConnectionStatus::SelfConnection);
    }

    #[test]
    fn test_ping_answers_pong() {
        let mut record = ConnectionRecord::new("10.0.0.1:9000");
        let reply = Message::Ping(9).on_received(&local(), &mut record);
        assert_eq!(reply, Some(Message::Pong(9)));
        assert_eq!(record.status, ConnectionStatus::Initial);
    }

    #[test]
    fn test_new_head_only_moves_forward() {
        let mut record = ConnectionRecord::new("10.0.0.1:9000");
        Message::NewHead(BlockHead::new("b10", "b9", 10)).on_received(&local(), &mut record);
        Message::NewHead(BlockHead::new("b4", "b3", 4)).on_received(&local(), &mut record);

        assert_eq!(record.latest_height, 10);
        assert_eq!(record.latest_head.unwrap().hash, "b10");
    }
}
