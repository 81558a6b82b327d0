pub mod message;
pub mod peers;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use message::{
    BlockPublish, PeerStatus, PrivateMessage, RumorMessage, SimpleMessage, StatusPacket, TxPublish,
};
pub use peers::{AddressError, PeerAddress, PeerSet, SharedPeers};

/// Largest datagram we read or write
pub const MAX_PACKET_SIZE: usize = 65_507;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("packet of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
}

/// One packet kind per datagram. Decoding rejects payloads naming zero or several kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipPacket {
    Simple(SimpleMessage),
    Rumor(RumorMessage),
    Status(StatusPacket),
    Private(PrivateMessage),
    TxPublish(TxPublish),
    BlockPublish(BlockPublish),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Simple,
    Rumor,
    Status,
    Private,
    TxPublish,
    BlockPublish,
}

impl GossipPacket {
    pub fn kind(&self) -> PacketKind {
        match self {
            GossipPacket::Simple(_) => PacketKind::Simple,
            GossipPacket::Rumor(_) => PacketKind::Rumor,
            GossipPacket::Status(_) => PacketKind::Status,
            GossipPacket::Private(_) => PacketKind::Private,
            GossipPacket::TxPublish(_) => PacketKind::TxPublish,
            GossipPacket::BlockPublish(_) => PacketKind::BlockPublish,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(WireError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Simple => "SIMPLE",
            PacketKind::Rumor => "RUMOR",
            PacketKind::Status => "STATUS",
            PacketKind::Private => "PRIVATE",
            PacketKind::TxPublish => "TX",
            PacketKind::BlockPublish => "BLOCK",
        };
        f.write_str(name)
    }
}

/// Datagram handed from the transport to the gossip loop
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub from: PeerAddress,
    pub packet: GossipPacket,
}

/// Send request for the transport
#[derive(Debug, Clone)]
pub enum Outbound {
    Unicast {
        to: PeerAddress,
        packet: GossipPacket,
    },
    /// Every known peer except `exclude`
    Broadcast {
        packet: GossipPacket,
        exclude: Option<PeerAddress>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kinds_survive_the_wire() {
        let packet = GossipPacket::Rumor(RumorMessage::new("n1", 1, "hi"));
        let decoded = GossipPacket::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.kind(), PacketKind::Rumor);

        let status = GossipPacket::Status(StatusPacket::Route {
            route: "n2".to_string(),
        });
        let decoded = GossipPacket::decode(&status.encode().unwrap()).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_decode_rejects_zero_or_multiple_kinds() {
        assert!(GossipPacket::decode(b"{}").is_err());
        assert!(GossipPacket::decode(
            br#"{"Rumor":{"origin":"a","sequence":1,"text":"x"},"Status":{"Route":{"route":"a"}}}"#
        )
        .is_err());
        assert!(GossipPacket::decode(br#"{"Unknown":{}}"#).is_err());
        assert!(GossipPacket::decode(b"not json").is_err());
    }

    #[test]
    fn test_route_rumor_shape() {
        let route = RumorMessage::route("n1");
        assert!(route.is_route());
        assert!(!RumorMessage::new("n1", 1, "").is_route());
        assert!(!RumorMessage::new("n1", 0, "x").is_route());
    }
}
