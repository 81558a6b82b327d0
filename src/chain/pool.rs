use std::collections::HashMap;

use super::block::Block;
use super::transaction::Transaction;
use crate::hash::HashValue;

/// Unconfirmed transactions keyed by name
#[derive(Debug, Default, Clone)]
pub struct TransactionPool {
    transactions: HashMap<HashValue, Transaction>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tx: Transaction) -> bool {
        if self.transactions.contains_key(&tx.name) {
            return false;
        }
        self.transactions.insert(tx.name, tx);
        true
    }

    pub fn contains(&self, name: &HashValue) -> bool {
        self.transactions.contains_key(name)
    }

    /// Drops every pooled transaction the block confirms
    pub fn remove_confirmed(&mut self, block: &Block) -> usize {
        block
            .transactions
            .iter()
            .filter(|tx| self.transactions.remove(&tx.name).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Snapshot ordered by name so candidates are reproducible
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self.transactions.values().cloned().collect();
        txs.sort_by(|a, b| a.name.cmp(&b.name));
        txs
    }
}

/// Every block received that did not directly extend the head, keyed by nonce
#[derive(Debug, Default, Clone)]
pub struct BlockPool {
    blocks: HashMap<HashValue, Block>,
}

impl BlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: Block) -> bool {
        if self.blocks.contains_key(&block.nonce) {
            return false;
        }
        self.blocks.insert(block.nonce, block);
        true
    }

    pub fn contains(&self, nonce: &HashValue) -> bool {
        self.blocks.contains_key(nonce)
    }

    pub fn get(&self, nonce: &HashValue) -> Option<&Block> {
        self.blocks.get(nonce)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }
}
