use log::{debug, info};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::block::{Block, BlockType};
use super::pool::{BlockPool, TransactionPool};
use super::transaction::Transaction;
use crate::hash::HashValue;

/// Blocks from genesis to head; each block's `prev_hash` is the previous block's nonce
#[derive(Debug, Clone, Default)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn head(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Nonce of the head, or the zero hash a genesis block points at
    pub fn head_hash(&self) -> HashValue {
        self.head().map(|block| block.nonce).unwrap_or_else(HashValue::zero)
    }

    pub fn position(&self, nonce: &HashValue) -> Option<usize> {
        self.blocks.iter().position(|block| block.nonce == *nonce)
    }

    pub fn contains_block(&self, nonce: &HashValue) -> bool {
        self.position(nonce).is_some()
    }

    pub fn contains_transaction(&self, name: &HashValue) -> bool {
        self.blocks.iter().any(|block| block.contains_transaction(name))
    }

    fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Keeps everything up to and including `parent` (nothing for `None`) and returns the rest
    fn truncate_after(&mut self, parent: Option<usize>) -> Vec<Block> {
        let keep = parent.map_or(0, |index| index + 1);
        self.blocks.split_off(keep)
    }

    pub fn is_linked(&self) -> bool {
        let genesis_ok = self
            .blocks
            .first()
            .map_or(true, |block| block.prev_hash.is_zero());
        genesis_ok && self.blocks.windows(2).all(|pair| pair[0].is_parent_of(&pair[1]))
    }
}

/// Pooled blocks hanging off the canonical chain after `parent_index` (`None` = before genesis)
#[derive(Debug, Clone)]
pub struct SideChain {
    pub parent_index: Option<usize>,
    pub blocks: Vec<Block>,
}

impl SideChain {
    /// Strictly longer than the canonical suffix it would replace
    fn overtakes(&self, canonical_len: usize) -> bool {
        let kept = self.parent_index.map_or(0, |index| index + 1);
        self.blocks.len() > canonical_len.saturating_sub(kept)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Nonce does not meet the difficulty
    Invalid,
    /// Already known
    Ignored,
    /// Appended to the head. `preempted` is set when it confirmed part of the block being mined.
    Extended { preempted: bool },
    /// Parked in the block pool
    Stored,
    /// A side chain replaced `dropped` canonical blocks; `requeued` went back to the pool
    Reorganized {
        dropped: usize,
        requeued: Vec<Transaction>,
    },
}

impl BlockOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, BlockOutcome::Invalid | BlockOutcome::Ignored)
    }

    pub fn moved_head(&self) -> bool {
        matches!(
            self,
            BlockOutcome::Extended { .. } | BlockOutcome::Reorganized { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub length: usize,
    pub head: HashValue,
    pub pooled_transactions: usize,
    pub pooled_blocks: usize,
    pub side_chains: usize,
}

/// Canonical chain, side chains and both pools
#[derive(Debug)]
pub struct Blockchain {
    difficulty: usize,
    canonical: Chain,
    side_chains: Vec<SideChain>,
    tx_pool: TransactionPool,
    block_pool: BlockPool,
}

impl Blockchain {
    pub fn new(difficulty: usize) -> Self {
        Self {
            difficulty,
            canonical: Chain::new(),
            side_chains: Vec::new(),
            tx_pool: TransactionPool::new(),
            block_pool: BlockPool::new(),
        }
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn canonical(&self) -> &Chain {
        &self.canonical
    }

    pub fn side_chains(&self) -> &[SideChain] {
        &self.side_chains
    }

    pub fn tx_pool(&self) -> &TransactionPool {
        &self.tx_pool
    }

    pub fn block_pool(&self) -> &BlockPool {
        &self.block_pool
    }

    pub fn block_type(&self, block: &Block) -> BlockType {
        if self.canonical.contains_block(&block.nonce) {
            BlockType::Old
        } else if block.prev_hash == self.canonical.head_hash() {
            // a pooled orphan whose parent just became the head is applied like a fresh block
            BlockType::Current
        } else if self.block_pool.contains(&block.nonce) {
            BlockType::Old
        } else {
            BlockType::UnknownParent
        }
    }

    pub fn is_transaction_known(&self, name: &HashValue) -> bool {
        self.tx_pool.contains(name) || self.canonical.contains_transaction(name)
    }

    /// Pools a transaction unless it is pending or confirmed already
    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        if self.is_transaction_known(&tx.name) {
            return false;
        }
        self.tx_pool.insert(tx)
    }

    /// Applies a block. `mining` is the candidate currently being mined, if any.
    pub fn add_block(&mut self, block: Block, mining: Option<&Block>) -> BlockOutcome {
        if !block.meets_difficulty(self.difficulty) {
            debug!("rejecting block {}: difficulty not met", block.nonce.short());
            return BlockOutcome::Invalid;
        }

        match self.block_type(&block) {
            BlockType::Old => BlockOutcome::Ignored,
            BlockType::Current => {
                let preempted = match mining {
                    Some(candidate) if candidate.shares_transactions(&block) => {
                        let pending = candidate
                            .transactions
                            .iter()
                            .filter(|tx| !tx.is_coinbase())
                            .cloned();
                        self.requeue(pending);
                        true
                    }
                    _ => false,
                };
                self.extend(block);
                BlockOutcome::Extended { preempted }
            }
            BlockType::UnknownParent => {
                self.block_pool.insert(block);
                self.rebuild_side_chains();
                match self.longest_side_chain() {
                    Some(side) => self.reorganize(side),
                    None => BlockOutcome::Stored,
                }
            }
        }
    }

    fn extend(&mut self, block: Block) {
        self.tx_pool.remove_confirmed(&block);
        info!(
            "CHAIN height {} head {} ({} txs)",
            self.canonical.len() + 1,
            block.nonce.short(),
            block.transactions.len()
        );
        self.canonical.push(block);
    }

    /// Returns how many transactions actually went back into the pool
    fn requeue(&mut self, txs: impl IntoIterator<Item = Transaction>) -> usize {
        let mut count = 0;
        for tx in txs {
            if !self.canonical.contains_transaction(&tx.name) && self.tx_pool.insert(tx) {
                count += 1;
            }
        }
        count
    }

    /// Rebuilds every side chain from the non-canonical part of the block pool
    pub fn rebuild_side_chains(&mut self) {
        let orphans: Vec<&Block> = self
            .block_pool
            .iter()
            .filter(|block| !self.canonical.contains_block(&block.nonce))
            .collect();
        let nonces: HashSet<HashValue> = orphans.iter().map(|block| block.nonce).collect();

        let mut children: HashMap<HashValue, Vec<&Block>> = HashMap::new();
        for block in &orphans {
            children.entry(block.prev_hash).or_default().push(*block);
        }
        for siblings in children.values_mut() {
            siblings.sort_by_key(|block| block.nonce);
        }

        let mut roots: Vec<&Block> = orphans
            .iter()
            .filter(|block| !nonces.contains(&block.prev_hash))
            .copied()
            .collect();
        roots.sort_by_key(|block| block.nonce);

        let mut side_chains = Vec::new();
        for root in roots {
            let parent_index = match self.canonical.position(&root.prev_hash) {
                Some(index) => Some(index),
                None if root.prev_hash.is_zero() => None,
                // Parent unknown to us, nothing to attach to yet
                None => continue,
            };
            side_chains.push(SideChain {
                parent_index,
                blocks: longest_path(root, &children),
            });
        }
        self.side_chains = side_chains;
    }

    fn longest_side_chain(&self) -> Option<SideChain> {
        let canonical_len = self.canonical.len();
        self.side_chains
            .iter()
            .filter(|side| side.overtakes(canonical_len))
            .max_by_key(|side| side.blocks.len())
            .cloned()
    }

    fn reorganize(&mut self, side: SideChain) -> BlockOutcome {
        let removed = self.canonical.truncate_after(side.parent_index);
        let dropped = removed.len();
        info!(
            "FORK-LONGER rewind {} blocks, splicing {} from side chain",
            dropped,
            side.blocks.len()
        );

        // the losing branch stays pooled so it can still win back
        let orphaned: Vec<Transaction> = removed
            .into_iter()
            .flat_map(|block| {
                let transactions = block.transactions.clone();
                self.block_pool.insert(block);
                transactions
            })
            .collect();
        self.requeue(orphaned.iter().cloned());

        for block in side.blocks {
            debug_assert_eq!(block.prev_hash, self.canonical.head_hash());
            self.extend(block);
        }

        let mut seen = HashSet::new();
        let requeued = orphaned
            .into_iter()
            .filter(|tx| self.tx_pool.contains(&tx.name) && seen.insert(tx.name))
            .collect();

        self.rebuild_side_chains();
        BlockOutcome::Reorganized { dropped, requeued }
    }

    /// A pooled block that now extends the head, if one arrived before its parent
    pub fn next_pooled_block(&self) -> Option<Block> {
        let head = self.canonical.head_hash();
        self.block_pool
            .iter()
            .find(|block| block.prev_hash == head && !self.canonical.contains_block(&block.nonce))
            .cloned()
    }

    /// Coinbase plus every pooled transaction on top of the head; `None` with an empty pool
    pub fn build_candidate(&self, coinbase: Transaction) -> Option<Block> {
        if self.tx_pool.is_empty() {
            return None;
        }
        let coinbase_name = coinbase.name;
        let mut transactions = vec![coinbase];
        transactions.extend(
            self.tx_pool
                .transactions()
                .into_iter()
                .filter(|tx| tx.name != coinbase_name),
        );
        Some(Block::candidate(self.canonical.head_hash(), transactions))
    }

    /// Credits minus debits of `hash` over the canonical chain only
    pub fn balance(&self, hash: &HashValue) -> i64 {
        self.canonical
            .blocks()
            .iter()
            .flat_map(|block| block.transactions.iter())
            .map(|tx| {
                let mut delta = 0i64;
                if tx.output == *hash {
                    delta += i64::from(tx.amount);
                }
                if tx.input == *hash {
                    delta -= i64::from(tx.amount);
                }
                delta
            })
            .sum()
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            length: self.canonical.len(),
            head: self.canonical.head_hash(),
            pooled_transactions: self.tx_pool.len(),
            pooled_blocks: self.block_pool.len(),
            side_chains: self.side_chains.len(),
        }
    }
}

fn longest_path(block: &Block, children: &HashMap<HashValue, Vec<&Block>>) -> Vec<Block> {
    let mut best: Vec<Block> = Vec::new();
    if let Some(next) = children.get(&block.nonce) {
        for child in next {
            let path = longest_path(child, children);
            if path.len() > best.len() {
                best = path;
            }
        }
    }
    let mut path = Vec::with_capacity(best.len() + 1);
    path.push(block.clone());
    path.extend(best);
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::block::test_util::{mined, transfer};

    fn hash(name: &str) -> HashValue {
        HashValue::digest(name.as_bytes())
    }

    #[test]
    fn test_balance_over_canonical_chain() {
        let mut chain = Blockchain::new(1);
        let b1 = mined(HashValue::zero(), vec![transfer("A", "B", 10)], 1);
        let b2 = mined(b1.id(), vec![transfer("B", "A", 4)], 1);
        assert_eq!(chain.add_block(b1, None), BlockOutcome::Extended { preempted: false });
        assert_eq!(chain.add_block(b2, None), BlockOutcome::Extended { preempted: false });

        assert_eq!(chain.balance(&hash("A")), -6);
        assert_eq!(chain.balance(&hash("B")), 6);
        assert_eq!(chain.balance(&hash("C")), 0);
    }

    #[test]
    fn test_block_without_work_is_rejected() {
        let mut chain = Blockchain::new(1);
        let mut block = Block::candidate(HashValue::zero(), vec![transfer("A", "B", 1)]);
        block.nonce = HashValue::from_bytes([9u8; 32]);

        assert_eq!(chain.block_type(&block), BlockType::Current);
        assert_eq!(chain.add_block(block, None), BlockOutcome::Invalid);
        assert!(chain.canonical().is_empty());
        assert!(chain.block_pool().is_empty());
    }

    #[test]
    fn test_block_classification() {
        let mut chain = Blockchain::new(1);
        let b1 = mined(HashValue::zero(), vec![transfer("A", "B", 1)], 1);
        let b2 = mined(b1.id(), vec![transfer("B", "C", 1)], 1);
        let b3 = mined(b2.id(), vec![transfer("C", "D", 1)], 1);

        assert_eq!(chain.block_type(&b1), BlockType::Current);
        assert_eq!(chain.block_type(&b2), BlockType::UnknownParent);
        chain.add_block(b1.clone(), None);
        assert_eq!(chain.block_type(&b1), BlockType::Old);

        // orphan waits in the pool until its parent arrives
        assert_eq!(chain.add_block(b3.clone(), None), BlockOutcome::Stored);
        assert_eq!(chain.block_type(&b3), BlockType::Old);
        assert_eq!(chain.add_block(b3, None), BlockOutcome::Ignored);
    }

    #[test]
    fn test_longer_side_chain_reorganizes_and_requeues() {
        let mut chain = Blockchain::new(1);
        let tx_a = transfer("A", "B", 5);
        let tx_b = transfer("B", "C", 2);
        let tx_c = transfer("C", "D", 1);

        let b1 = mined(HashValue::zero(), vec![transfer("G", "H", 1)], 1);
        let b2 = mined(b1.id(), vec![tx_a.clone(), tx_b.clone()], 1);
        chain.add_block(b1.clone(), None);
        chain.add_block(b2.clone(), None);
        assert_eq!(chain.canonical().len(), 2);

        let side1 = mined(b1.id(), vec![tx_b.clone()], 1);
        let side2 = mined(side1.id(), vec![tx_c.clone()], 1);

        // equal length is not enough
        assert_eq!(chain.add_block(side1.clone(), None), BlockOutcome::Stored);
        assert_eq!(chain.canonical().len(), 2);

        let outcome = chain.add_block(side2.clone(), None);
        assert_eq!(
            outcome,
            BlockOutcome::Reorganized {
                dropped: 1,
                requeued: vec![tx_a.clone()],
            }
        );

        let canonical = chain.canonical();
        assert_eq!(canonical.len(), 3);
        assert!(canonical.is_linked());
        assert_eq!(canonical.head_hash(), side2.id());

        // tx_a was only in the dropped block, tx_b survived in the side chain
        assert_eq!(chain.tx_pool().len(), 1);
        assert!(chain.tx_pool().contains(&tx_a.name));
        assert!(!chain.tx_pool().contains(&tx_b.name));
        // the dropped block is now the only side chain
        assert_eq!(chain.side_chains().len(), 1);
        assert_eq!(chain.side_chains()[0].blocks, vec![b2]);
        assert_eq!(chain.side_chains()[0].parent_index, Some(0));
    }

    #[test]
    fn test_side_chain_from_genesis_replaces_whole_chain() {
        let mut chain = Blockchain::new(1);
        let tx = transfer("A", "B", 1);
        let b1 = mined(HashValue::zero(), vec![tx.clone()], 1);
        chain.add_block(b1, None);

        let s1 = mined(HashValue::zero(), vec![transfer("X", "Y", 1)], 1);
        let s2 = mined(s1.id(), vec![transfer("Y", "Z", 1)], 1);
        assert_eq!(chain.add_block(s1, None), BlockOutcome::Stored);
        assert!(matches!(
            chain.add_block(s2.clone(), None),
            BlockOutcome::Reorganized { dropped: 1, .. }
        ));
        assert_eq!(chain.canonical().head_hash(), s2.id());
        assert!(chain.tx_pool().contains(&tx.name));
    }

    #[test]
    fn test_preempted_candidate_is_requeued() {
        let mut chain = Blockchain::new(1);
        let shared = transfer("A", "B", 1);
        let mine_only = transfer("C", "D", 1);
        chain.add_transaction(shared.clone());
        chain.add_transaction(mine_only.clone());

        let candidate = chain
            .build_candidate(Transaction::coinbase(hash("me"), 1))
            .unwrap();
        assert_eq!(candidate.transactions.len(), 3);
        assert!(candidate.transactions[0].is_coinbase());

        let remote = mined(HashValue::zero(), vec![shared.clone()], 1);
        assert_eq!(
            chain.add_block(remote, Some(&candidate)),
            BlockOutcome::Extended { preempted: true }
        );
        assert!(chain.tx_pool().contains(&mine_only.name));
        assert!(!chain.tx_pool().contains(&shared.name));
        assert_eq!(chain.tx_pool().len(), 1);
    }

    #[test]
    fn test_known_transactions_are_not_pooled_twice() {
        let mut chain = Blockchain::new(1);
        let tx = transfer("A", "B", 1);
        assert!(chain.add_transaction(tx.clone()));
        assert!(!chain.add_transaction(tx.clone()));

        chain.add_block(mined(HashValue::zero(), vec![tx.clone()], 1), None);
        assert!(chain.tx_pool().is_empty());
        assert!(!chain.add_transaction(tx));
        assert!(chain.build_candidate(Transaction::coinbase(hash("me"), 1)).is_none());
    }

    #[test]
    fn test_next_pooled_block_connects_orphans() {
        let mut chain = Blockchain::new(1);
        let b1 = mined(HashValue::zero(), vec![transfer("A", "B", 1)], 1);
        let b2 = mined(b1.id(), vec![transfer("B", "C", 1)], 1);
        let b3 = mined(b2.id(), vec![transfer("C", "D", 1)], 1);

        assert_eq!(chain.add_block(b3.clone(), None), BlockOutcome::Stored);
        chain.add_block(b1, None);
        assert!(chain.next_pooled_block().is_none());

        chain.add_block(b2, None);
        let next = chain.next_pooled_block().unwrap();
        assert_eq!(next, b3);
        assert_eq!(chain.add_block(next, None), BlockOutcome::Extended { preempted: false });
        assert_eq!(chain.canonical().len(), 3);
        assert!(chain.canonical().is_linked());
        assert!(chain.next_pooled_block().is_none());
    }

    #[test]
    fn test_dropped_branch_grows_and_wins_back() {
        let mut chain = Blockchain::new(1);
        let a1 = mined(HashValue::zero(), vec![transfer("A", "B", 1)], 1);
        let a2 = mined(a1.id(), vec![transfer("A", "B", 2)], 1);
        chain.add_block(a1.clone(), None);
        chain.add_block(a2.clone(), None);

        let b1 = mined(HashValue::zero(), vec![transfer("C", "D", 1)], 1);
        let b2 = mined(b1.id(), vec![transfer("C", "D", 2)], 1);
        let b3 = mined(b2.id(), vec![transfer("C", "D", 3)], 1);
        assert_eq!(chain.add_block(b1, None), BlockOutcome::Stored);
        assert_eq!(chain.add_block(b2, None), BlockOutcome::Stored);
        assert!(matches!(
            chain.add_block(b3, None),
            BlockOutcome::Reorganized { dropped: 2, .. }
        ));
        assert!(chain.block_pool().contains(&a1.id()));
        assert!(chain.block_pool().contains(&a2.id()));

        let a3 = mined(a2.id(), vec![transfer("A", "B", 3)], 1);
        let a4 = mined(a3.id(), vec![transfer("A", "B", 4)], 1);
        assert_eq!(chain.add_block(a3, None), BlockOutcome::Stored);
        match chain.add_block(a4.clone(), None) {
            BlockOutcome::Reorganized { dropped, requeued } => {
                assert_eq!(dropped, 3);
                assert_eq!(requeued.len(), 3);
            }
            other => panic!("expected a reorganization, got {:?}", other),
        }

        assert_eq!(chain.canonical().len(), 4);
        assert_eq!(chain.canonical().head_hash(), a4.id());
        assert!(chain.canonical().is_linked());
        assert_eq!(chain.balance(&hash("B")), 10);
        assert_eq!(chain.balance(&hash("D")), 0);
        assert!(chain.tx_pool().contains(&transfer("C", "D", 1).name));
        assert!(!chain.tx_pool().contains(&transfer("A", "B", 1).name));
    }
}
