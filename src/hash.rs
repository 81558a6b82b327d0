use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest used for transaction names, block nonces and miner identities
const HASH_LENGTH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashValue([u8; HASH_LENGTH]);

pub struct HashWriter(Sha256);

#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl Serialize for HashValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        hex::encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HashValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex_str = String::deserialize(deserializer)?;
        hex_str.parse().map_err(serde::de::Error::custom)
    }
}

impl HashValue {
    pub fn zero() -> Self {
        Self([0u8; HASH_LENGTH])
    }

    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Hash data in one shot
    pub fn digest<T: AsRef<[u8]>>(data: T) -> Self {
        let mut writer = HashWriter::new();
        writer.update(data.as_ref());
        writer.finish()
    }

    /// Number of leading zero bytes, the unit of mining difficulty
    pub fn leading_zero_bytes(&self) -> usize {
        self.0.iter().take_while(|b| **b == 0).count()
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl HashWriter {
    pub fn new() -> Self {
        HashWriter(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn finish(self) -> HashValue {
        let mut out = [0u8; HASH_LENGTH];
        out.copy_from_slice(&self.0.finalize());
        HashValue(out)
    }
}

impl Default for HashWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for HashValue {
    fn default() -> Self {
        Self::zero()
    }
}

impl AsRef<[u8]> for HashValue {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for HashValue {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        if bytes.len() != HASH_LENGTH {
            return Err(HashParseError::Length(bytes.len()));
        }
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&bytes);
        Ok(HashValue(hash))
    }
}
