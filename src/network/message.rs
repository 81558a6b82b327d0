use serde::{Deserialize, Serialize};

use crate::chain::block::Block;
use crate::chain::transaction::Transaction;

/// Flooded text, tagged with the last relay so it is not echoed straight back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleMessage {
    pub original_name: String,
    pub relay_address: String,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RumorMessage {
    pub origin: String,
    pub sequence: u32,
    pub text: String,
}

impl RumorMessage {
    pub fn new(origin: impl Into<String>, sequence: u32, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            sequence,
            text: text.into(),
        }
    }

    /// Route discovery rumor: sequence 0, no text
    pub fn route(origin: impl Into<String>) -> Self {
        Self::new(origin, 0, "")
    }

    pub fn is_route(&self) -> bool {
        self.sequence == 0 && self.text.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub origin: String,
    pub sequence: u32,
    pub destination: String,
    pub text: String,
    pub hop_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub identifier: String,
    pub next_sequence: u32,
}

/// Either a full status vector or a route acknowledgment naming the acknowledging node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusPacket {
    Want { want: Vec<PeerStatus> },
    Route { route: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPublish {
    pub transaction: Transaction,
    pub hop_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPublish {
    pub block: Block,
    pub hop_limit: u32,
}
