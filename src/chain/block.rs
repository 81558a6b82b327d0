use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::transaction::Transaction;
use crate::hash::{HashValue, HashWriter};

/// Proof-of-work predicate: the first `difficulty` bytes of the hash are zero
pub fn meets_difficulty(hash: &HashValue, difficulty: usize) -> bool {
    hash.leading_zero_bytes() >= difficulty
}

/// A block is identified by its nonce, which is also its proof of work.
/// The next block links to it through `prev_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub prev_hash: HashValue,
    pub nonce: HashValue,
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<Transaction>,
}

/// Where a block fits relative to what we already hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Extends the canonical head
    Current,
    /// Already in the canonical chain or the block pool
    Old,
    /// Parent not on the canonical head
    UnknownParent,
}

impl Block {
    /// Candidate block on top of `prev_hash`, not yet mined
    pub fn candidate(prev_hash: HashValue, transactions: Vec<Transaction>) -> Self {
        Self {
            prev_hash,
            nonce: HashValue::zero(),
            timestamp: Utc::now(),
            transactions,
        }
    }

    pub fn id(&self) -> HashValue {
        self.nonce
    }

    /// SHA-256(prev_hash || nonce || timestamp millis LE || tx count LE u32 || tx names)
    pub fn content_hash(&self) -> HashValue {
        let mut writer = HashWriter::new();
        writer
            .update(self.prev_hash.as_bytes())
            .update(self.nonce.as_bytes())
            .update(&self.timestamp.timestamp_millis().to_le_bytes())
            .update(&(self.transactions.len() as u32).to_le_bytes());
        for tx in &self.transactions {
            writer.update(tx.name.as_bytes());
        }
        writer.finish()
    }

    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        meets_difficulty(&self.nonce, difficulty)
    }

    pub fn is_parent_of(&self, child: &Block) -> bool {
        child.prev_hash == self.nonce
    }

    pub fn contains_transaction(&self, name: &HashValue) -> bool {
        self.transactions.iter().any(|tx| tx.name == *name)
    }

    pub fn shares_transactions(&self, other: &Block) -> bool {
        let names: HashSet<HashValue> = self.transactions.iter().map(|tx| tx.name).collect();
        other.transactions.iter().any(|tx| names.contains(&tx.name))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Mines a block synchronously; tests use difficulty 1 so this is a few hundred hashes
    pub fn mined(prev_hash: HashValue, transactions: Vec<Transaction>, difficulty: usize) -> Block {
        let mut block = Block::candidate(prev_hash, transactions);
        loop {
            block.nonce = block.content_hash();
            if block.meets_difficulty(difficulty) {
                return block;
            }
        }
    }

    pub fn transfer(from: &str, to: &str, amount: u32) -> Transaction {
        Transaction::new(
            HashValue::digest(from.as_bytes()),
            HashValue::digest(to.as_bytes()),
            amount,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_difficulty_predicate() {
        let mut bytes = [7u8; 32];
        assert!(!meets_difficulty(&HashValue::from_bytes(bytes), 1));
        bytes[0] = 0;
        assert!(meets_difficulty(&HashValue::from_bytes(bytes), 1));
        assert!(!meets_difficulty(&HashValue::from_bytes(bytes), 2));
        assert!(meets_difficulty(&HashValue::from_bytes(bytes), 0));
    }

    #[test]
    fn test_mined_block_links_and_shares() {
        let tx = transfer("alice", "bob", 3);
        let parent = mined(HashValue::zero(), vec![tx.clone()], 1);
        assert!(parent.meets_difficulty(1));

        let child = mined(parent.id(), vec![tx.clone()], 1);
        assert!(parent.is_parent_of(&child));
        assert!(!child.is_parent_of(&parent));
        assert!(child.shares_transactions(&parent));
        assert!(child.contains_transaction(&tx.name));

        let other = mined(parent.id(), vec![transfer("bob", "carol", 1)], 1);
        assert!(!other.shares_transactions(&parent));
    }

    #[test]
    fn test_content_hash_covers_transactions() {
        let block = Block::candidate(HashValue::zero(), vec![transfer("a", "b", 1)]);
        let mut changed = block.clone();
        changed.transactions.push(transfer("b", "c", 1));
        assert_ne!(block.content_hash(), changed.content_hash());
    }
}
