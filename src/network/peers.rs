use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid peer address '{0}', expected ip:port")]
    Invalid(String),
}

/// UDP endpoint of a peer, validated on construction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Parses a comma separated list, ignoring empty items
    pub fn parse_list(list: &str) -> Result<Vec<PeerAddress>, AddressError> {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::parse::<PeerAddress>)
            .collect()
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<SocketAddr>()
            .map(PeerAddress)
            .map_err(|_| AddressError::Invalid(s.to_string()))
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for PeerAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub type SharedPeers = Arc<RwLock<PeerSet>>;

/// Known peers in insertion order. Removal is permanent unless the peer is added again.
#[derive(Debug, Default, Clone)]
pub struct PeerSet {
    peers: Vec<PeerAddress>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_peers(peers: impl IntoIterator<Item = PeerAddress>) -> Self {
        let mut set = Self::new();
        set.add_peers(peers);
        set
    }

    pub fn shared(self) -> SharedPeers {
        Arc::new(RwLock::new(self))
    }

    pub fn add(&mut self, peer: PeerAddress) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Returns how many peers were actually new
    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = PeerAddress>) -> usize {
        peers.into_iter().filter(|peer| self.add(*peer)).count()
    }

    pub fn remove(&mut self, peer: &PeerAddress) -> bool {
        let before = self.peers.len();
        self.peers.retain(|known| known != peer);
        before != self.peers.len()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peers.iter()
    }

    pub fn to_vec(&self) -> Vec<PeerAddress> {
        self.peers.clone()
    }

    /// Uniform pick among peers not in `excluded`
    pub fn random_peer(&self, excluded: &HashSet<PeerAddress>) -> Option<PeerAddress> {
        self.peers
            .iter()
            .filter(|peer| !excluded.contains(*peer))
            .choose(&mut rand::thread_rng())
            .copied()
    }
}

impl fmt::Display for PeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.peers.iter().map(ToString::to_string).collect();
        write!(f, "{}", joined.join(","))
    }
}
