pub mod api_server;
pub mod chain;
pub mod config;
pub mod gossip;
pub mod hash;
pub mod network;
pub mod node;
