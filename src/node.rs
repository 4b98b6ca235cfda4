//! Local node identity
//!
//! Identity and chain tip of this node, as advertised in the handshake.

use crate::chain::{BlockHead, ChainTip};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::RwLock;

/// Opaque node identifier exchanged during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// This node, as seen by the connection pool
#[derive(Debug)]
pub struct LocalNode {
    id: NodeId,
    user_agent: String,
    tip: RwLock<ChainTip>,
}

impl LocalNode {
    /// Create a node with a random identity and an empty chain
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self::with_id(NodeId::random(), user_agent)
    }

    pub fn with_id(id: NodeId, user_agent: impl Into<String>) -> Self {
        Self {
            id,
            user_agent: user_agent.into(),
            tip: RwLock::new(ChainTip::default()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Current best chain of this node
    pub async fn tip(&self) -> ChainTip {
        self.tip.read().await.clone()
    }

    /// Record a new best block (called by chain bookkeeping)
    pub async fn update_tip(&self, head: BlockHead) {
        let mut tip = self.tip.write().await;
        log::debug!("Local tip advanced to {} ({})", head.height, head.hash);
        *tip = ChainTip::from_head(head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_is_hex() {
        let id = NodeId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[tokio::test]
    async fn test_update_tip() {
        let node = LocalNode::new("test/0.1");
        assert_eq!(node.tip().await.height, 0);

        node.update_tip(BlockHead::new("h1", "h0", 1)).await;
        let tip = node.tip().await;
        assert_eq!(tip.height, 1);
        assert_eq!(tip.head.unwrap().previous_hash, "h0");
    }
}
