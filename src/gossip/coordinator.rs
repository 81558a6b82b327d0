use log::{debug, info, warn};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use super::monger::{MongerEngine, MongerHandle, MongerId, MongerSettings, MongerSignal};
use super::router::RoutingTable;
use super::store::{Freshness, MessageStore, StatusVector};
use crate::chain::coordinator::ChainCommand;
use crate::chain::transaction::Transaction;
use crate::config::GossipConfig;
use crate::hash::HashValue;
use crate::network::{
    GossipPacket, InboundPacket, Outbound, PeerAddress, PrivateMessage, RumorMessage,
    SharedPeers, SimpleMessage, StatusPacket,
};

/// Something a local client asked the node to do
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Rumor {
        text: String,
    },
    Private {
        destination: String,
        text: String,
    },
    Broadcast {
        text: String,
    },
    Transaction {
        input: HashValue,
        output: HashValue,
        amount: u32,
    },
    AddPeer(PeerAddress),
}

#[derive(Debug)]
pub enum GossipCommand {
    Client(ClientRequest),
    AntiEntropyTick,
    RouteTick,
    Shutdown,
}

/// Read side of the coordinator's state
#[derive(Clone)]
pub struct GossipState {
    pub peers: SharedPeers,
    pub rumors: Arc<RwLock<MessageStore<RumorMessage>>>,
    /// Private messages delivered to this node, by origin
    pub private: Arc<RwLock<MessageStore<PrivateMessage>>>,
    /// Private messages this node sent, by destination
    pub sent_private: Arc<RwLock<BTreeMap<String, Vec<PrivateMessage>>>>,
    pub routes: Arc<RwLock<RoutingTable>>,
}

pub struct GossipChannels {
    pub commands: mpsc::Sender<GossipCommand>,
    pub packets: mpsc::Sender<InboundPacket>,
}

/// Explicit route probing driven by the route timer
#[derive(Debug, Default)]
struct RouteProbe {
    peer: Option<PeerAddress>,
    acked: bool,
    retries: u32,
    tried: HashSet<PeerAddress>,
}

pub struct GossipCoordinator {
    name: String,
    address: PeerAddress,
    config: GossipConfig,
    state: GossipState,
    mongers: HashMap<MongerId, MongerHandle>,
    next_monger: MongerId,
    rumor_counter: u32,
    /// Private sequences are counted per destination so every receiver sees 1, 2, 3...
    private_counters: HashMap<String, u32>,
    swept: HashSet<PeerAddress>,
    route_probe: RouteProbe,
    route_relays: HashMap<String, Instant>,
    commands: mpsc::Receiver<GossipCommand>,
    packets: mpsc::Receiver<InboundPacket>,
    monger_done_tx: mpsc::UnboundedSender<MongerId>,
    monger_done: mpsc::UnboundedReceiver<MongerId>,
    outbound: mpsc::Sender<Outbound>,
    chain: mpsc::Sender<ChainCommand>,
}

impl GossipCoordinator {
    pub fn new(
        name: impl Into<String>,
        address: PeerAddress,
        config: GossipConfig,
        peers: SharedPeers,
        outbound: mpsc::Sender<Outbound>,
        chain: mpsc::Sender<ChainCommand>,
    ) -> (Self, GossipChannels) {
        let capacity = config.channel_capacity.max(1);
        let (commands_tx, commands) = mpsc::channel(capacity);
        let (packets_tx, packets) = mpsc::channel(capacity);
        let (monger_done_tx, monger_done) = mpsc::unbounded_channel();

        let state = GossipState {
            peers,
            rumors: Arc::new(RwLock::new(MessageStore::new())),
            private: Arc::new(RwLock::new(MessageStore::new())),
            sent_private: Arc::new(RwLock::new(BTreeMap::new())),
            routes: Arc::new(RwLock::new(RoutingTable::new())),
        };
        let coordinator = Self {
            name: name.into(),
            address,
            config,
            state,
            mongers: HashMap::new(),
            next_monger: 0,
            rumor_counter: 0,
            private_counters: HashMap::new(),
            swept: HashSet::new(),
            route_probe: RouteProbe::default(),
            route_relays: HashMap::new(),
            commands,
            packets,
            monger_done_tx,
            monger_done,
            outbound,
            chain,
        };
        let channels = GossipChannels {
            commands: commands_tx,
            packets: packets_tx,
        };
        (coordinator, channels)
    }

    pub fn state(&self) -> GossipState {
        self.state.clone()
    }

    pub async fn run(mut self) {
        info!("🚀 gossip node {} listening on {}", self.name, self.address);
        loop {
            tokio::select! {
                Some(id) = self.monger_done.recv() => {
                    self.mongers.remove(&id);
                }
                command = self.commands.recv() => match command {
                    Some(GossipCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(inbound) = self.packets.recv() => self.handle_packet(inbound).await,
            }
        }
        self.shutdown().await;
    }

    /// Stops every engine and waits for it before the loop lets go of its channels
    async fn shutdown(&mut self) {
        let handles: Vec<MongerHandle> = self.mongers.drain().map(|(_, handle)| handle).collect();
        debug!("{}: stopping {} mongers", self.name, handles.len());
        futures::future::join_all(handles.into_iter().map(MongerHandle::shutdown)).await;
        info!("gossip node {} stopped", self.name);
    }

    async fn handle_command(&mut self, command: GossipCommand) {
        match command {
            GossipCommand::Client(request) => self.handle_client(request).await,
            GossipCommand::AntiEntropyTick => self.anti_entropy().await,
            GossipCommand::RouteTick => self.route_tick().await,
            GossipCommand::Shutdown => {}
        }
    }

    async fn handle_client(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Rumor { text } => {
                self.rumor_counter += 1;
                let message = RumorMessage::new(&self.name, self.rumor_counter, text);
                info!("CLIENT MESSAGE {}", message.text);
                if !self.state.rumors.write().await.append(message.clone()) {
                    warn!(
                        "own rumor {} does not follow the stored sequence, not sent",
                        message.sequence
                    );
                    return;
                }
                self.swept.clear();
                self.start_monger(message, None);
            }
            ClientRequest::Private { destination, text } => {
                let counter = self.private_counters.entry(destination.clone()).or_insert(0);
                *counter += 1;
                let message = PrivateMessage {
                    origin: self.name.clone(),
                    sequence: *counter,
                    destination,
                    text,
                    hop_limit: self.config.private_hop_limit,
                };
                if message.destination == self.name {
                    self.state.private.write().await.append(message);
                    return;
                }
                self.state
                    .sent_private
                    .write()
                    .await
                    .entry(message.destination.clone())
                    .or_default()
                    .push(message.clone());
                self.forward_private(message).await;
            }
            ClientRequest::Broadcast { text } => {
                let message = SimpleMessage {
                    original_name: self.name.clone(),
                    relay_address: self.address.to_string(),
                    contents: text,
                };
                self.send(Outbound::Broadcast {
                    packet: GossipPacket::Simple(message),
                    exclude: None,
                })
                .await;
            }
            ClientRequest::Transaction {
                input,
                output,
                amount,
            } => {
                let tx = Transaction::new(input, output, amount);
                self.delegate(ChainCommand::Submit(tx)).await;
            }
            ClientRequest::AddPeer(peer) => {
                if peer == self.address {
                    return;
                }
                if self.state.peers.write().await.add(peer) {
                    info!("added peer {}", peer);
                }
                self.send_status(peer).await;
            }
        }
    }

    async fn handle_packet(&mut self, inbound: InboundPacket) {
        let InboundPacket { from, packet } = inbound;
        if from != self.address && self.state.peers.write().await.add(from) {
            info!("learned peer {} from traffic", from);
        }
        debug!("{} packet from {}", packet.kind(), from);

        match packet {
            GossipPacket::Simple(message) => self.handle_simple(from, message).await,
            GossipPacket::Rumor(message) => self.handle_rumor(from, message).await,
            GossipPacket::Status(status) => self.handle_status(from, status).await,
            GossipPacket::Private(message) => self.handle_private(from, message).await,
            GossipPacket::TxPublish(publish) => {
                self.delegate(ChainCommand::Transaction {
                    tx: publish.transaction,
                    hop_limit: publish.hop_limit,
                    from,
                })
                .await
            }
            GossipPacket::BlockPublish(publish) => {
                self.delegate(ChainCommand::Block {
                    block: publish.block,
                    hop_limit: publish.hop_limit,
                    from,
                })
                .await
            }
        }
    }

    async fn handle_simple(&mut self, from: PeerAddress, message: SimpleMessage) {
        if message.original_name == self.name {
            return;
        }
        info!(
            "SIMPLE MESSAGE origin {} from {} contents {}",
            message.original_name, message.relay_address, message.contents
        );
        let relay = message
            .relay_address
            .parse::<PeerAddress>()
            .unwrap_or(from);
        let forwarded = SimpleMessage {
            relay_address: self.address.to_string(),
            ..message
        };
        self.send(Outbound::Broadcast {
            packet: GossipPacket::Simple(forwarded),
            exclude: Some(relay),
        })
        .await;
    }

    async fn handle_rumor(&mut self, from: PeerAddress, message: RumorMessage) {
        info!(
            "RUMOR origin {} from {} seq {} contents {}",
            message.origin, from, message.sequence, message.text
        );
        self.learn_route(&message.origin, from).await;

        if message.is_route() {
            self.handle_route_rumor(from, message).await;
            return;
        }

        let freshness = self
            .state
            .rumors
            .read()
            .await
            .compare(&message.origin, message.sequence);
        if freshness == Freshness::New {
            let appended = self.state.rumors.write().await.append(message.clone());
            if appended {
                if message.origin == self.name {
                    // our own rumor from before a restart
                    self.rumor_counter = self.rumor_counter.max(message.sequence);
                }
                for handle in self.mongers.values() {
                    handle.signal(MongerSignal::ForgetTried);
                }
                self.swept.clear();
                self.start_monger(message, Some(from));
            }
        }
        self.send_status(from).await;
    }

    async fn handle_route_rumor(&mut self, from: PeerAddress, message: RumorMessage) {
        let ack = GossipPacket::Status(StatusPacket::Route {
            route: self.name.clone(),
        });
        self.send(Outbound::Unicast { to: from, packet: ack }).await;

        if message.origin == self.name {
            return;
        }
        // relay each origin's route rumor at most once per route period
        let now = Instant::now();
        if let Some(last) = self.route_relays.get(&message.origin) {
            if now.duration_since(*last) < self.config.route_period() {
                debug!("route rumor for {} relayed recently", message.origin);
                return;
            }
        }
        self.route_relays.insert(message.origin.clone(), now);
        self.start_monger(message, Some(from));
    }

    async fn handle_status(&mut self, from: PeerAddress, status: StatusPacket) {
        match status {
            StatusPacket::Route { route } => {
                debug!("ROUTE STATUS from {} naming {}", from, route);
                self.learn_route(&route, from).await;
                if let Some(id) = self.find_monger(&from, true) {
                    self.signal(id, MongerSignal::Stop);
                }
                if self.route_probe.peer == Some(from) {
                    self.route_probe.acked = true;
                    self.route_probe.retries = 0;
                }
            }
            StatusPacket::Want { want } => {
                self.reconcile(from, StatusVector::from(&want[..])).await
            }
        }
    }

    async fn reconcile(&mut self, from: PeerAddress, theirs: StatusVector) {
        let summary: Vec<String> = theirs
            .iter()
            .map(|(origin, next)| format!("peer {} nextID {}", origin, next))
            .collect();
        info!("STATUS from {} {}", from, summary.join(" "));

        let monger = self.find_monger(&from, false);
        if let Some(id) = monger {
            self.signal(id, MongerSignal::Sync);
        }

        let (pushes, behind) = {
            let store = self.state.rumors.read().await;
            match store.first_gap(&theirs) {
                Some(first) => (vec![first.clone()], false),
                None => {
                    let mut pushes = Vec::new();
                    let mut behind = false;
                    for (origin, next) in theirs.iter() {
                        match store.compare(origin, next.saturating_sub(1)) {
                            Freshness::New => behind = true,
                            Freshness::Old => pushes.extend(store.get(origin, next).cloned()),
                            Freshness::InSync => {}
                        }
                    }
                    (pushes, behind)
                }
            }
        };

        let in_sync = pushes.is_empty() && !behind;
        if behind {
            self.send_status(from).await;
        }
        for message in pushes {
            self.send(Outbound::Unicast {
                to: from,
                packet: GossipPacket::Rumor(message),
            })
            .await;
        }

        if in_sync {
            info!("IN SYNC WITH {}", from);
            if let Some(id) = monger {
                let keep_going = rand::thread_rng().gen_bool(self.config.coin_probability());
                let signal = if keep_going {
                    MongerSignal::Reset
                } else {
                    MongerSignal::Stop
                };
                self.signal(id, signal);
            }
        }
    }

    async fn handle_private(&mut self, from: PeerAddress, message: PrivateMessage) {
        self.learn_route(&message.origin, from).await;

        if message.destination == self.name {
            info!(
                "PRIVATE origin {} hop-limit {} contents {}",
                message.origin, message.hop_limit, message.text
            );
            if !self.state.private.write().await.append(message) {
                debug!("out of order private message dropped");
            }
            return;
        }

        let hop_limit = message.hop_limit.saturating_sub(1);
        if hop_limit == 0 {
            debug!("private message for {} ran out of hops", message.destination);
            return;
        }
        self.forward_private(PrivateMessage {
            hop_limit,
            ..message
        })
        .await;
    }

    async fn forward_private(&mut self, message: PrivateMessage) {
        let next_hop = self.state.routes.read().await.next_hop(&message.destination);
        match next_hop {
            Some(next_hop) => {
                self.send(Outbound::Unicast {
                    to: next_hop,
                    packet: GossipPacket::Private(message),
                })
                .await
            }
            None => warn!("no route to {}, private message dropped", message.destination),
        }
    }

    /// Status-pings one peer not yet contacted in the current sweep
    async fn anti_entropy(&mut self) {
        let peer = {
            let peers = self.state.peers.read().await;
            match peers.random_peer(&self.swept) {
                Some(peer) => Some(peer),
                None => {
                    self.swept.clear();
                    peers.random_peer(&self.swept)
                }
            }
        };
        if let Some(peer) = peer {
            self.swept.insert(peer);
            debug!("anti-entropy with {}", peer);
            self.send_status(peer).await;
        }
    }

    /// Re-sends the route rumor to an unresponsive probe target, evicting it after
    /// `max_retries` unanswered periods; otherwise probes a fresh peer.
    async fn route_tick(&mut self) {
        if let Some(peer) = self.route_probe.peer {
            if !self.route_probe.acked {
                self.route_probe.retries += 1;
                if self.route_probe.retries < self.config.max_retries {
                    self.send_route_rumor(peer).await;
                    return;
                }
                if self.state.peers.write().await.remove(&peer) {
                    warn!(
                        "evicting {} after {} unanswered route probes",
                        peer, self.route_probe.retries
                    );
                }
            }
            self.route_probe.peer = None;
            self.route_probe.retries = 0;
        }

        let next = {
            let peers = self.state.peers.read().await;
            match peers.random_peer(&self.route_probe.tried) {
                Some(peer) => Some(peer),
                None => {
                    self.route_probe.tried.clear();
                    peers.random_peer(&self.route_probe.tried)
                }
            }
        };
        if let Some(peer) = next {
            self.route_probe.tried.insert(peer);
            self.route_probe.peer = Some(peer);
            self.route_probe.acked = false;
            self.send_route_rumor(peer).await;
        }
    }

    async fn send_route_rumor(&self, peer: PeerAddress) {
        self.send(Outbound::Unicast {
            to: peer,
            packet: GossipPacket::Rumor(RumorMessage::route(&self.name)),
        })
        .await;
    }

    async fn send_status(&self, peer: PeerAddress) {
        let want = self.state.rumors.read().await.status_vector().to_want();
        self.send(Outbound::Unicast {
            to: peer,
            packet: GossipPacket::Status(StatusPacket::Want { want }),
        })
        .await;
    }

    async fn learn_route(&self, origin: &str, from: PeerAddress) {
        if origin != self.name {
            self.state.routes.write().await.add_entry(origin, from);
        }
    }

    fn start_monger(&mut self, message: RumorMessage, origin_peer: Option<PeerAddress>) {
        self.next_monger += 1;
        let done = self.monger_done_tx.clone();
        let handle = MongerEngine::spawn(
            self.next_monger,
            message,
            origin_peer,
            MongerSettings::from(&self.config),
            self.state.peers.clone(),
            self.outbound.clone(),
            move |id| {
                let _ = done.send(id);
            },
        );
        self.mongers.insert(handle.id(), handle);
    }

    /// Engine currently waiting on `peer`; the oldest wins when several are
    fn find_monger(&self, peer: &PeerAddress, is_route: bool) -> Option<MongerId> {
        self.mongers
            .values()
            .filter(|handle| handle.is_route() == is_route && handle.current_peer() == Some(*peer))
            .map(MongerHandle::id)
            .min()
    }

    fn signal(&self, id: MongerId, signal: MongerSignal) {
        if let Some(handle) = self.mongers.get(&id) {
            if !handle.signal(signal) {
                debug!("monger {} did not take {:?}", id, signal);
            }
        }
    }

    async fn send(&self, request: Outbound) {
        if self.outbound.send(request).await.is_err() {
            debug!("{}: transport closed, dropping packet", self.name);
        }
    }

    async fn delegate(&self, command: ChainCommand) {
        if self.chain.send(command).await.is_err() {
            debug!("{}: chain coordinator gone", self.name);
        }
    }
}
