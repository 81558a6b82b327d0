use log::info;
use std::collections::BTreeMap;

use crate::network::PeerAddress;

/// DSDV style next-hop table: origin name -> peer that last relayed it
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: BTreeMap<String, PeerAddress>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins. Returns true only when the entry actually changed.
    pub fn add_entry(&mut self, origin: &str, next_hop: PeerAddress) -> bool {
        if self.routes.get(origin) == Some(&next_hop) {
            return false;
        }
        info!("DSDV {} {}", origin, next_hop);
        self.routes.insert(origin.to_string(), next_hop);
        true
    }

    pub fn next_hop(&self, origin: &str) -> Option<PeerAddress> {
        self.routes.get(origin).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, PeerAddress> {
        self.routes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut table = RoutingTable::new();
        let first: PeerAddress = "10.0.0.1:5000".parse().unwrap();
        let second: PeerAddress = "10.0.0.2:5000".parse().unwrap();

        assert!(table.add_entry("X", first));
        assert!(!table.add_entry("X", first));
        assert_eq!(table.next_hop("X"), Some(first));

        assert!(table.add_entry("X", second));
        assert_eq!(table.next_hop("X"), Some(second));
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_hop("Y"), None);
    }
}
