use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::chain::{ChainCommand, ChainCoordinator, ChainSummary, SharedChain};
use crate::config::{Config, NodeConfig};
use crate::gossip::{ClientRequest, GossipCommand, GossipCoordinator, GossipState};
use crate::hash::HashValue;
use crate::network::transport::{TransportError, TransportTasks, UdpTransport};
use crate::network::{PeerAddress, PeerSet, PrivateMessage, RumorMessage};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("node {0} is not running")]
    Stopped(String),
    #[error("unknown node {0}")]
    UnknownNode(String),
}

/// Snapshot served to clients
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub name: String,
    pub address: PeerAddress,
    pub miner: HashValue,
    pub messages: Vec<RumorMessage>,
    pub private_messages: Vec<PrivateMessage>,
    pub routes: BTreeMap<String, PeerAddress>,
    pub peers: Vec<PeerAddress>,
    pub chain: ChainSummary,
}

struct NodeTasks {
    gossip: JoinHandle<()>,
    chain: JoinHandle<()>,
    timers: Vec<JoinHandle<()>>,
    transport: TransportTasks,
}

/// A running gossip node: transport, both coordinators and their timers
pub struct Node {
    name: String,
    address: PeerAddress,
    miner_hash: HashValue,
    gossip: GossipState,
    chain: SharedChain,
    commands: mpsc::Sender<GossipCommand>,
    chain_commands: mpsc::Sender<ChainCommand>,
    tasks: Mutex<Option<NodeTasks>>,
}

impl Node {
    /// Binds the gossip socket and starts every task. A socket that cannot be bound is fatal.
    pub async fn start(config: NodeConfig) -> Result<Node, NodeError> {
        let transport = UdpTransport::bind(config.gossip_addr).await?;
        let address = transport.local_address();
        let capacity = config.gossip.channel_capacity.max(1);

        let peers = PeerSet::from_peers(config.peers.iter().copied().filter(|peer| *peer != address))
            .shared();
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        let (chain_coordinator, chain_commands) =
            ChainCoordinator::new(config.chain.clone(), capacity, outbound_tx.clone());
        let chain = chain_coordinator.chain();
        let miner_hash = chain_coordinator.miner_hash();

        let (gossip_coordinator, channels) = GossipCoordinator::new(
            config.name.clone(),
            address,
            config.gossip.clone(),
            peers.clone(),
            outbound_tx,
            chain_commands.clone(),
        );
        let gossip = gossip_coordinator.state();

        let transport = transport.spawn(peers, channels.packets, outbound_rx);
        let timers = vec![
            spawn_ticker(
                config.gossip.anti_entropy_period(),
                channels.commands.clone(),
                || GossipCommand::AntiEntropyTick,
            ),
            spawn_ticker(
                config.gossip.route_period(),
                channels.commands.clone(),
                || GossipCommand::RouteTick,
            ),
        ];
        let tasks = NodeTasks {
            gossip: tokio::spawn(gossip_coordinator.run()),
            chain: tokio::spawn(chain_coordinator.run()),
            timers,
            transport,
        };

        info!("✅ node {} started on {}", config.name, address);
        Ok(Node {
            name: config.name,
            address,
            miner_hash,
            gossip,
            chain,
            commands: channels.commands,
            chain_commands,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    pub fn miner_hash(&self) -> HashValue {
        self.miner_hash
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Queues a client request on the gossip coordinator
    pub async fn inject(&self, request: ClientRequest) -> Result<(), NodeError> {
        self.commands
            .send(GossipCommand::Client(request))
            .await
            .map_err(|_| NodeError::Stopped(self.name.clone()))
    }

    pub async fn add_peers(&self, peers: Vec<PeerAddress>) -> Result<(), NodeError> {
        for peer in peers {
            self.inject(ClientRequest::AddPeer(peer)).await?;
        }
        Ok(())
    }

    pub async fn state(&self) -> NodeState {
        let messages = self
            .gossip
            .rumors
            .read()
            .await
            .snapshot()
            .into_values()
            .flatten()
            .collect();
        // delivered to us first, then what we sent
        let mut private_messages: Vec<PrivateMessage> = self
            .gossip
            .private
            .read()
            .await
            .snapshot()
            .into_values()
            .flatten()
            .collect();
        private_messages.extend(
            self.gossip
                .sent_private
                .read()
                .await
                .values()
                .flatten()
                .cloned(),
        );
        let routes = self.gossip.routes.read().await.snapshot();
        let peers = self.gossip.peers.read().await.to_vec();
        let chain = self.chain.read().await.summary();

        NodeState {
            name: self.name.clone(),
            address: self.address,
            miner: self.miner_hash,
            messages,
            private_messages,
            routes,
            peers,
            chain,
        }
    }

    pub async fn balance(&self, hash: &HashValue) -> i64 {
        self.chain.read().await.balance(hash)
    }

    /// Gossip first so its mongers stop, then the chain and its miner, then the socket.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        for timer in &tasks.timers {
            timer.abort();
        }

        let _ = self.commands.send(GossipCommand::Shutdown).await;
        let _ = self.chain_commands.send(ChainCommand::Shutdown).await;
        let results = futures::future::join_all([tasks.gossip, tasks.chain]).await;
        for result in results {
            if let Err(e) = result {
                debug!("{}: task ended abnormally: {}", self.name, e);
            }
        }

        tasks.transport.abort();
        info!("🛑 node {} stopped", self.name);
    }
}

fn spawn_ticker(
    period: Duration,
    commands: mpsc::Sender<GossipCommand>,
    tick: fn() -> GossipCommand,
) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if commands.send(tick()).await.is_err() {
                break;
            }
        }
    })
}

/// Nodes started on behalf of the control API, keyed by name
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, Arc<Node>>>>,
    tunables: Config,
}

impl NodeRegistry {
    pub fn new(tunables: Config) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            tunables,
        }
    }

    /// Starts a node, or returns the running one with the same name or address
    pub async fn start_node(
        &self,
        name: &str,
        address: PeerAddress,
        peers: Vec<PeerAddress>,
    ) -> Result<Arc<Node>, NodeError> {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes
            .values()
            .find(|node| node.name() == name || node.address() == address)
        {
            info!("node {} already running on {}", existing.name(), existing.address());
            return Ok(existing.clone());
        }

        let config = NodeConfig::new(name, address)
            .with_peers(peers)
            .with_tunables(&self.tunables);
        let node = Arc::new(Node::start(config).await?);
        nodes.insert(name.to_string(), node.clone());
        Ok(node)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().await.get(name).cloned()
    }

    pub async fn stop_node(&self, name: &str) -> Result<(), NodeError> {
        let node = self
            .nodes
            .write()
            .await
            .remove(name)
            .ok_or_else(|| NodeError::UnknownNode(name.to_string()))?;
        node.stop().await;
        Ok(())
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn stop_all(&self) {
        let nodes: Vec<Arc<Node>> = self.nodes.write().await.drain().map(|(_, node)| node).collect();
        futures::future::join_all(nodes.iter().map(|node| node.stop())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfig, GossipConfig};

    fn loopback() -> PeerAddress {
        "127.0.0.1:0".parse().unwrap()
    }

    fn config(name: &str, peers: Vec<PeerAddress>) -> NodeConfig {
        let mut config = NodeConfig::new(name, loopback()).with_peers(peers);
        config.gossip = GossipConfig {
            anti_entropy_period_ms: 200,
            route_period_ms: 200,
            monger_timeout_ms: 200,
            ..GossipConfig::default()
        };
        config.chain = ChainConfig {
            difficulty: 1,
            publish_delay_factor: 0,
            ..ChainConfig::default()
        };
        config
    }

    async fn wait_for_state(node: &Node, check: impl Fn(&NodeState) -> bool) -> NodeState {
        for _ in 0..200 {
            let state = node.state().await;
            if check(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("node {} never reached the expected state", node.name());
    }

    #[tokio::test]
    async fn test_rumor_reaches_second_node() {
        let n2 = Node::start(config("n2", vec![])).await.unwrap();
        let n1 = Node::start(config("n1", vec![n2.address()])).await.unwrap();

        n1.inject(ClientRequest::Rumor { text: "hi".into() })
            .await
            .unwrap();

        let state = wait_for_state(&n2, |state| !state.messages.is_empty()).await;
        assert_eq!(state.messages, vec![RumorMessage::new("n1", 1, "hi")]);
        assert_eq!(state.routes.get("n1"), Some(&n1.address()));
        assert!(state.peers.contains(&n1.address()));

        let state = n1.state().await;
        assert_eq!(state.messages, vec![RumorMessage::new("n1", 1, "hi")]);

        n1.stop().await;
        n2.stop().await;
        assert!(!n1.is_running().await);
    }

    #[tokio::test]
    async fn test_private_message_uses_learned_route() {
        let n2 = Node::start(config("n2", vec![])).await.unwrap();
        let n1 = Node::start(config("n1", vec![n2.address()])).await.unwrap();

        // n1 talks first so n2 knows it as a peer
        n1.inject(ClientRequest::Rumor { text: "hello".into() })
            .await
            .unwrap();
        wait_for_state(&n2, |state| !state.messages.is_empty()).await;
        n2.inject(ClientRequest::Rumor { text: "back".into() })
            .await
            .unwrap();
        wait_for_state(&n1, |state| state.routes.contains_key("n2")).await;

        n1.inject(ClientRequest::Private {
            destination: "n2".into(),
            text: "secret".into(),
        })
        .await
        .unwrap();
        let state = wait_for_state(&n2, |state| !state.private_messages.is_empty()).await;
        assert_eq!(state.private_messages[0].origin, "n1");
        assert_eq!(state.private_messages[0].text, "secret");
        assert_eq!(state.private_messages[0].sequence, 1);

        // the sender keeps its own copy
        let sent = n1.state().await.private_messages;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "n2");
        assert_eq!(sent[0].text, "secret");

        n1.stop().await;
        n2.stop().await;
    }

    #[tokio::test]
    async fn test_transaction_is_mined_on_both_nodes() {
        let n2 = Node::start(config("n2", vec![])).await.unwrap();
        let n1 = Node::start(config("n1", vec![n2.address()])).await.unwrap();
        let (alice, bob) = (HashValue::digest("alice"), HashValue::digest("bob"));

        n1.inject(ClientRequest::Transaction {
            input: alice,
            output: bob,
            amount: 5,
        })
        .await
        .unwrap();

        wait_for_state(&n1, |state| state.chain.length >= 1).await;
        wait_for_state(&n2, |state| state.chain.length >= 1).await;
        assert_eq!(n1.balance(&bob).await, 5);
        assert_eq!(n2.balance(&bob).await, 5);
        assert_eq!(n1.balance(&alice).await, -5);

        n1.stop().await;
        n2.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let n1 = Node::start(config("n1", vec![])).await.unwrap();
        let clash = NodeConfig::new("n2", n1.address());
        assert!(matches!(
            Node::start(clash).await,
            Err(NodeError::Transport(TransportError::Bind { .. }))
        ));
        n1.stop().await;
    }

    #[tokio::test]
    async fn test_registry_reuses_and_stops_nodes() {
        let registry = NodeRegistry::new(Config::default());

        let first = registry.start_node("a", loopback(), vec![]).await.unwrap();
        let again = registry.start_node("a", loopback(), vec![]).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.names().await, vec!["a".to_string()]);

        registry.stop_node("a").await.unwrap();
        assert!(registry.get("a").await.is_none());
        assert!(!first.is_running().await);
        assert!(matches!(
            registry.stop_node("a").await,
            Err(NodeError::UnknownNode(_))
        ));
        assert!(matches!(
            first.inject(ClientRequest::Rumor { text: "late".into() }).await,
            Err(NodeError::Stopped(_))
        ));
    }
}
