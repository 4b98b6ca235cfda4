//! Chain-head summaries exchanged with peers
//!
//! The pool never interprets these; it only carries the latest head a peer
//! reported so the rest of the node can pick a sync source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of a block header as announced by a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHead {
    /// Hash of the block
    pub hash: String,
    /// Hash of the parent block
    pub previous_hash: String,
    /// Height of the block in its chain
    pub height: u64,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl BlockHead {
    pub fn new(hash: impl Into<String>, previous_hash: impl Into<String>, height: u64) -> Self {
        Self {
            hash: hash.into(),
            previous_hash: previous_hash.into(),
            height,
            timestamp: Utc::now(),
        }
    }
}

/// Best chain known to a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u64,
    pub head: Option<BlockHead>,
}

impl ChainTip {
    pub fn from_head(head: BlockHead) -> Self {
        Self {
            height: head.height,
            head: Some(head),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tip_from_head() {
        let tip = ChainTip::from_head(BlockHead::new("abc", "000", 42));
        assert_eq!(tip.height, 42);
        assert_eq!(tip.head.unwrap().hash, "abc");
    }

    #[test]
    fn test_default_tip_is_genesis_less() {
        let tip = ChainTip::default();
        assert_eq!(tip.height, 0);
        assert!(tip.head.is_none());
    }
}
