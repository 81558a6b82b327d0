//! Rumor mongering, anti-entropy, private routing and the coordinator that ties them together

pub mod coordinator;
pub mod monger;
pub mod router;
pub mod store;

pub use coordinator::{ClientRequest, GossipChannels, GossipCommand, GossipCoordinator, GossipState};
pub use monger::{MongerEngine, MongerHandle, MongerId, MongerSignal};
pub use router::RoutingTable;
pub use store::{Freshness, MessageStore, SequencedMessage, StatusVector};
