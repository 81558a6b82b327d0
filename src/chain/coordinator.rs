use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use super::block::Block;
use super::ledger::{BlockOutcome, Blockchain};
use super::miner::Miner;
use super::transaction::Transaction;
use crate::config::ChainConfig;
use crate::hash::HashValue;
use crate::network::{BlockPublish, GossipPacket, Outbound, PeerAddress, TxPublish};

pub type SharedChain = Arc<RwLock<Blockchain>>;

#[derive(Debug)]
pub enum ChainCommand {
    /// Transaction created on this node
    Submit(Transaction),
    Transaction {
        tx: Transaction,
        hop_limit: u32,
        from: PeerAddress,
    },
    Block {
        block: Block,
        hop_limit: u32,
        from: PeerAddress,
    },
    /// Result of our own mining attempt
    Mined {
        attempt: u64,
        block: Block,
        elapsed: Duration,
    },
    Shutdown,
}

/// Single loop owning chain mutations and the miner
pub struct ChainCoordinator {
    config: ChainConfig,
    miner_hash: HashValue,
    chain: SharedChain,
    commands: mpsc::Receiver<ChainCommand>,
    commands_tx: mpsc::Sender<ChainCommand>,
    outbound: mpsc::Sender<Outbound>,
    miner: Option<Miner>,
    next_attempt: u64,
    last_block_time: Duration,
}

impl ChainCoordinator {
    pub fn new(
        config: ChainConfig,
        capacity: usize,
        outbound: mpsc::Sender<Outbound>,
    ) -> (Self, mpsc::Sender<ChainCommand>) {
        let (commands_tx, commands) = mpsc::channel(capacity.max(1));
        let miner_hash = config.miner_hash.unwrap_or_else(random_miner_hash);
        let chain = Arc::new(RwLock::new(Blockchain::new(config.difficulty)));

        info!("⛏️  miner identity {}", miner_hash);
        let coordinator = Self {
            config,
            miner_hash,
            chain,
            commands,
            commands_tx: commands_tx.clone(),
            outbound,
            miner: None,
            next_attempt: 0,
            last_block_time: Duration::ZERO,
        };
        (coordinator, commands_tx)
    }

    pub fn chain(&self) -> SharedChain {
        self.chain.clone()
    }

    pub fn miner_hash(&self) -> HashValue {
        self.miner_hash
    }

    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                ChainCommand::Shutdown => break,
                ChainCommand::Submit(tx) => {
                    let hop_limit = self.config.tx_hop_limit;
                    self.handle_transaction(tx, hop_limit, None).await;
                }
                ChainCommand::Transaction { tx, hop_limit, from } => {
                    self.handle_transaction(tx, hop_limit, Some(from)).await;
                }
                ChainCommand::Block {
                    block,
                    hop_limit,
                    from,
                } => self.handle_block(block, hop_limit, from).await,
                ChainCommand::Mined {
                    attempt,
                    block,
                    elapsed,
                } => self.handle_mined(attempt, block, elapsed).await,
            }
        }
        self.stop_mining();
        debug!("chain coordinator stopped");
    }

    async fn handle_transaction(&mut self, tx: Transaction, hop_limit: u32, from: Option<PeerAddress>) {
        if !tx.is_well_formed() {
            warn!("dropping transaction with mismatched name {}", tx.name);
            return;
        }
        let added = self.chain.write().await.add_transaction(tx.clone());
        if !added {
            debug!("transaction {} already known", tx.name.short());
            return;
        }
        info!("TX pooled {}", tx);

        // local transactions start with the full hop budget
        let next_hop = match from {
            Some(_) => hop_limit.saturating_sub(1),
            None => hop_limit,
        };
        if next_hop > 0 {
            let packet = GossipPacket::TxPublish(TxPublish {
                transaction: tx,
                hop_limit: next_hop,
            });
            self.publish(packet, from).await;
        }
        self.build_and_mine().await;
    }

    async fn handle_block(&mut self, block: Block, hop_limit: u32, from: PeerAddress) {
        let outcome = self.apply_block(block.clone()).await;
        if !outcome.is_accepted() {
            return;
        }
        let next_hop = hop_limit.saturating_sub(1);
        if next_hop > 0 {
            let packet = GossipPacket::BlockPublish(BlockPublish {
                block,
                hop_limit: next_hop,
            });
            self.publish(packet, Some(from)).await;
        }
        if outcome.moved_head() {
            self.build_and_mine().await;
        }
    }

    async fn handle_mined(&mut self, attempt: u64, block: Block, elapsed: Duration) {
        match &self.miner {
            Some(miner) if miner.attempt() == attempt => {}
            _ => {
                debug!("discarding result of stale mining attempt {}", attempt);
                return;
            }
        }
        self.miner = None;
        self.last_block_time = elapsed;
        info!("FOUND-BLOCK {} in {:?}", block.nonce, elapsed);

        let outcome = self.apply_block(block.clone()).await;
        if outcome.is_accepted() {
            self.schedule_publish(block, elapsed);
        }
        self.build_and_mine().await;
    }

    /// Publishes a self-mined block once peers have had time to hear about competing ones
    fn schedule_publish(&self, block: Block, elapsed: Duration) {
        let delay = elapsed * self.config.publish_delay_factor;
        let packet = GossipPacket::BlockPublish(BlockPublish {
            block,
            hop_limit: self.config.block_hop_limit,
        });
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let request = Outbound::Broadcast {
                packet,
                exclude: None,
            };
            if outbound.send(request).await.is_err() {
                debug!("transport gone before block publication");
            }
        });
    }

    async fn apply_block(&mut self, block: Block) -> BlockOutcome {
        let nonce = block.nonce;
        let outcome = {
            let mut chain = self.chain.write().await;
            let candidate = self.miner.as_ref().map(Miner::candidate);
            chain.add_block(block, candidate)
        };

        match &outcome {
            BlockOutcome::Extended { preempted } => {
                debug!("block {} extends the head (preempted: {})", nonce.short(), preempted);
                self.stop_mining();
            }
            BlockOutcome::Reorganized { dropped, requeued } => {
                info!(
                    "reorganized onto {} dropping {} blocks, {} transactions back in the pool",
                    nonce.short(),
                    dropped,
                    requeued.len()
                );
                self.stop_mining();
                for tx in requeued.clone() {
                    let packet = GossipPacket::TxPublish(TxPublish {
                        transaction: tx,
                        hop_limit: self.config.tx_hop_limit,
                    });
                    self.publish(packet, None).await;
                }
            }
            BlockOutcome::Stored => info!("FORK-SHORTER block {} kept in the pool", nonce.short()),
            BlockOutcome::Invalid => warn!("block {} does not meet the difficulty", nonce.short()),
            BlockOutcome::Ignored => debug!("block {} already known", nonce.short()),
        }
        outcome
    }

    /// Connects pooled blocks that now extend the head, then mines the pool if idle
    async fn build_and_mine(&mut self) {
        loop {
            let next = self.chain.read().await.next_pooled_block();
            let Some(block) = next else {
                break;
            };
            if !self.apply_block(block).await.moved_head() {
                break;
            }
        }

        if self.miner.is_some() {
            return;
        }
        let coinbase = Transaction::coinbase(self.miner_hash, self.config.coinbase_reward);
        let candidate = self.chain.read().await.build_candidate(coinbase);
        if let Some(candidate) = candidate {
            self.next_attempt += 1;
            debug!(
                "mining attempt {} over {} transactions (last block took {:?})",
                self.next_attempt,
                candidate.transactions.len(),
                self.last_block_time
            );
            self.miner = Some(Miner::start(
                self.next_attempt,
                candidate,
                self.config.difficulty,
                self.commands_tx.clone(),
            ));
        }
    }

    fn stop_mining(&mut self) {
        if let Some(miner) = self.miner.take() {
            miner.stop();
        }
    }

    async fn publish(&self, packet: GossipPacket, exclude: Option<PeerAddress>) {
        if self.outbound.send(Outbound::Broadcast { packet, exclude }).await.is_err() {
            debug!("transport gone, dropping broadcast");
        }
    }
}

/// SHA-256 over random bytes, used when no miner identity is configured
pub fn random_miner_hash() -> HashValue {
    HashValue::digest(rand::random::<[u8; 32]>())
}
