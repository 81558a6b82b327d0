use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::block::{meets_difficulty, Block};
use super::coordinator::ChainCommand;

/// Hash-chain search: every attempt hashes the block with the previous attempt as its
/// nonce, until an attempt meets the difficulty or `stop` is raised.
pub fn search(mut block: Block, difficulty: usize, stop: &AtomicBool) -> Option<Block> {
    while !stop.load(Ordering::Relaxed) {
        block.nonce = block.content_hash();
        if meets_difficulty(&block.nonce, difficulty) {
            return Some(block);
        }
    }
    None
}

/// One mining attempt running on the blocking pool. Dropping it stops the search.
pub struct Miner {
    attempt: u64,
    candidate: Block,
    stop: Arc<AtomicBool>,
}

impl Miner {
    /// The found block is queued back on `results` as `ChainCommand::Mined`
    pub fn start(
        attempt: u64,
        candidate: Block,
        difficulty: usize,
        results: mpsc::Sender<ChainCommand>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let work = candidate.clone();

        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let Some(block) = search(work, difficulty, &flag) else {
                debug!("mining attempt {} stopped", attempt);
                return;
            };
            if flag.load(Ordering::Relaxed) {
                return;
            }
            let mined = ChainCommand::Mined {
                attempt,
                block,
                elapsed: started.elapsed(),
            };
            if results.blocking_send(mined).is_err() {
                debug!("mining attempt {} finished after shutdown", attempt);
            }
        });

        Self {
            attempt,
            candidate,
            stop,
        }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn candidate(&self) -> &Block {
        &self.candidate
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.stop();
    }
}
