use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::GossipConfig;
use crate::network::{GossipPacket, Outbound, PeerAddress, RumorMessage, SharedPeers};

pub type MongerId = u64;

/// Control messages from the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MongerSignal {
    /// The current target answered with a status; stop timing out while we reconcile
    Sync,
    /// Reconciliation finished and the coin said go on
    Reset,
    Stop,
    /// Fresh rumor arrived somewhere; peers tried so far may be worth another go
    ForgetTried,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MongerState {
    Idle,
    Mongering,
    WaitingAck,
    Synchronizing,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct MongerSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub continue_probability: f64,
}

impl From<&GossipConfig> for MongerSettings {
    fn from(config: &GossipConfig) -> Self {
        Self {
            timeout: config.monger_timeout(),
            max_retries: config.max_retries.max(1),
            continue_probability: config.coin_probability(),
        }
    }
}

/// Coordinator side of a running engine
pub struct MongerHandle {
    id: MongerId,
    is_route: bool,
    origin: String,
    target: watch::Receiver<Option<PeerAddress>>,
    signals: mpsc::Sender<MongerSignal>,
    task: JoinHandle<()>,
}

impl MongerHandle {
    pub fn id(&self) -> MongerId {
        self.id
    }

    pub fn is_route(&self) -> bool {
        self.is_route
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Peer the engine is currently talking to
    pub fn current_peer(&self) -> Option<PeerAddress> {
        *self.target.borrow()
    }

    /// Never blocks; a full or closed queue means the engine is busy stopping anyway
    pub fn signal(&self, signal: MongerSignal) -> bool {
        self.signals.try_send(signal).is_ok()
    }

    /// Asks the engine to stop and waits for it. Dropping the signal queue ends the
    /// engine even when the stop request itself does not fit.
    pub async fn shutdown(self) {
        let MongerHandle {
            id, signals, task, ..
        } = self;
        let _ = signals.try_send(MongerSignal::Stop);
        drop(signals);
        if let Err(e) = task.await {
            warn!("monger {} ended abnormally: {}", id, e);
        }
    }
}

/// Spreads one rumor: pick a peer, send, wait for an acknowledgment or a timeout.
///
/// When the coin says continue after a timeout, the tried set is cleared but the rumor is
/// resent to the same unanswering peer, not to a fresh random pick. Only after
/// `max_retries` such rounds is that peer evicted and a new one drawn.
pub struct MongerEngine {
    id: MongerId,
    message: RumorMessage,
    origin_peer: Option<PeerAddress>,
    tried: HashSet<PeerAddress>,
    current: Option<PeerAddress>,
    retries: u32,
    settings: MongerSettings,
    synchronizing: bool,
    state: MongerState,
    deadline: Option<Instant>,
    peers: SharedPeers,
    outbound: mpsc::Sender<Outbound>,
    signals: mpsc::Receiver<MongerSignal>,
    target: watch::Sender<Option<PeerAddress>>,
}

impl MongerEngine {
    /// Starts an engine task. `on_stop` runs once with the engine id when it terminates.
    pub fn spawn<F>(
        id: MongerId,
        message: RumorMessage,
        origin_peer: Option<PeerAddress>,
        settings: MongerSettings,
        peers: SharedPeers,
        outbound: mpsc::Sender<Outbound>,
        on_stop: F,
    ) -> MongerHandle
    where
        F: FnOnce(MongerId) + Send + 'static,
    {
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let (target_tx, target_rx) = watch::channel(None);
        let is_route = message.is_route();
        let origin = message.origin.clone();

        let mut engine = MongerEngine {
            id,
            message,
            origin_peer,
            tried: HashSet::new(),
            current: None,
            retries: 0,
            settings,
            synchronizing: false,
            state: MongerState::Idle,
            deadline: None,
            peers,
            outbound,
            signals: signal_rx,
            target: target_tx,
        };
        engine.reset_tried();

        let task = tokio::spawn(async move {
            engine.run().await;
            on_stop(id);
        });

        MongerHandle {
            id,
            is_route,
            origin,
            target: target_rx,
            signals: signal_tx,
            task,
        }
    }

    async fn run(mut self) {
        self.state = MongerState::Mongering;
        self.monger().await;

        while self.state != MongerState::Stopped {
            let deadline = self.deadline;
            tokio::select! {
                signal = self.signals.recv() => self.on_signal(signal).await,
                _ = wait_until(deadline) => self.on_timeout().await,
            }
        }

        self.target.send_replace(None);
        debug!(
            "monger {} for {}#{} stopped",
            self.id, self.message.origin, self.message.sequence
        );
    }

    async fn monger(&mut self) {
        let next = self.peers.read().await.random_peer(&self.tried);
        match next {
            Some(peer) => {
                self.tried.insert(peer);
                self.send_to(peer).await;
            }
            None => {
                debug!(
                    "monger {}: no peers left for {}#{}",
                    self.id, self.message.origin, self.message.sequence
                );
                self.stop();
            }
        }
    }

    async fn send_to(&mut self, peer: PeerAddress) {
        self.current = Some(peer);
        self.target.send_replace(Some(peer));
        info!("MONGERING with {}", peer);

        let request = Outbound::Unicast {
            to: peer,
            packet: GossipPacket::Rumor(self.message.clone()),
        };
        if self.outbound.send(request).await.is_err() {
            self.stop();
            return;
        }
        self.deadline = Some(Instant::now() + self.settings.timeout);
        self.state = MongerState::WaitingAck;
    }

    async fn on_signal(&mut self, signal: Option<MongerSignal>) {
        match signal {
            Some(MongerSignal::Sync) => {
                self.synchronizing = true;
                self.retries = 0;
                self.deadline = None;
                self.state = MongerState::Synchronizing;
            }
            Some(MongerSignal::Reset) => {
                self.synchronizing = false;
                self.retries = 0;
                self.state = MongerState::Mongering;
                self.monger().await;
            }
            Some(MongerSignal::ForgetTried) => self.reset_tried(),
            Some(MongerSignal::Stop) | None => self.stop(),
        }
    }

    async fn on_timeout(&mut self) {
        self.deadline = None;
        if self.synchronizing {
            return;
        }
        if !rand::thread_rng().gen_bool(self.settings.continue_probability) {
            self.stop();
            return;
        }

        self.retries += 1;
        let target = self.current;
        self.reset_tried();

        if self.retries >= self.settings.max_retries {
            if let Some(peer) = target {
                if self.peers.write().await.remove(&peer) {
                    warn!("evicting {} after {} unanswered sends", peer, self.retries);
                }
            }
            self.retries = 0;
            self.current = None;
            self.monger().await;
            return;
        }

        let still_known = match target {
            Some(peer) => self.peers.read().await.contains(&peer),
            None => false,
        };
        match target {
            Some(peer) if still_known => {
                info!("FLIPPED COIN sending rumor to {}", peer);
                self.tried.insert(peer);
                self.send_to(peer).await;
            }
            _ => {
                self.retries = 0;
                self.monger().await;
            }
        }
    }

    fn reset_tried(&mut self) {
        self.tried.clear();
        if let Some(origin) = self.origin_peer {
            self.tried.insert(origin);
        }
    }

    fn stop(&mut self) {
        self.state = MongerState::Stopped;
        self.deadline = None;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
