use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::{HashValue, HashWriter};

/// Unauthenticated value transfer between two hashes. `name` is the content address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub input: HashValue,
    pub output: HashValue,
    pub amount: u32,
    pub name: HashValue,
}

impl Transaction {
    pub fn new(input: HashValue, output: HashValue, amount: u32) -> Self {
        let name = Self::compute_name(&input, &output, amount);
        Self {
            input,
            output,
            amount,
            name,
        }
    }

    /// Reward for the miner of a block; it has no real input
    pub fn coinbase(miner: HashValue, reward: u32) -> Self {
        Self::new(HashValue::zero(), miner, reward)
    }

    /// SHA-256(amount as little-endian u32 || input || output)
    pub fn compute_name(input: &HashValue, output: &HashValue, amount: u32) -> HashValue {
        let mut writer = HashWriter::new();
        writer
            .update(&amount.to_le_bytes())
            .update(input.as_bytes())
            .update(output.as_bytes());
        writer.finish()
    }

    pub fn is_coinbase(&self) -> bool {
        self.input.is_zero()
    }

    /// True when `name` matches the content; anything else was tampered with or corrupted
    pub fn is_well_formed(&self) -> bool {
        self.name == Self::compute_name(&self.input, &self.output, self.amount)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({}) [{}]",
            self.input.short(),
            self.output.short(),
            self.amount,
            self.name.short()
        )
    }
}
