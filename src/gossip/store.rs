use serde::Serialize;
use std::collections::BTreeMap;

use crate::network::{PeerStatus, PrivateMessage, RumorMessage};

/// Anything stored per origin with a gap-free sequence starting at 1
pub trait SequencedMessage: Clone {
    fn origin(&self) -> &str;
    fn sequence(&self) -> u32;
}

impl SequencedMessage for RumorMessage {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl SequencedMessage for PrivateMessage {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Result of comparing a sequence against what we hold for its origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Origin unknown or the sequence is past our last message
    New,
    InSync,
    Old,
}

/// Next expected sequence per origin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusVector(BTreeMap<String, u32>);

impl StatusVector {
    pub fn next_sequence(&self, origin: &str) -> Option<u32> {
        self.0.get(origin).copied()
    }

    pub fn contains(&self, origin: &str) -> bool {
        self.0.contains_key(origin)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(origin, next)| (origin.as_str(), *next))
    }

    pub fn to_want(&self) -> Vec<PeerStatus> {
        self.0
            .iter()
            .map(|(identifier, next_sequence)| PeerStatus {
                identifier: identifier.clone(),
                next_sequence: *next_sequence,
            })
            .collect()
    }
}

impl From<&[PeerStatus]> for StatusVector {
    fn from(want: &[PeerStatus]) -> Self {
        StatusVector(
            want.iter()
                .map(|status| (status.identifier.clone(), status.next_sequence))
                .collect(),
        )
    }
}

/// Per-origin append-only log; index `i` holds sequence `i + 1`
#[derive(Debug, Clone)]
pub struct MessageStore<M> {
    messages: BTreeMap<String, Vec<M>>,
}

impl<M> Default for MessageStore<M> {
    fn default() -> Self {
        Self {
            messages: BTreeMap::new(),
        }
    }
}

impl<M: SequencedMessage> MessageStore<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 0 when nothing is stored for `origin`
    pub fn last_sequence(&self, origin: &str) -> u32 {
        self.messages
            .get(origin)
            .map_or(0, |log| log.len() as u32)
    }

    pub fn compare(&self, origin: &str, sequence: u32) -> Freshness {
        if !self.messages.contains_key(origin) {
            return Freshness::New;
        }
        let last = self.last_sequence(origin);
        match sequence.cmp(&last) {
            std::cmp::Ordering::Greater => Freshness::New,
            std::cmp::Ordering::Equal => Freshness::InSync,
            std::cmp::Ordering::Less => Freshness::Old,
        }
    }

    /// Appends only the direct successor of the last stored sequence
    pub fn append(&mut self, message: M) -> bool {
        let expected = self.last_sequence(message.origin()) + 1;
        if message.sequence() != expected {
            return false;
        }
        self.messages
            .entry(message.origin().to_string())
            .or_default()
            .push(message);
        true
    }

    pub fn get(&self, origin: &str, sequence: u32) -> Option<&M> {
        let index = sequence.checked_sub(1)? as usize;
        self.messages.get(origin)?.get(index)
    }

    pub fn status_vector(&self) -> StatusVector {
        StatusVector(
            self.messages
                .iter()
                .map(|(origin, log)| (origin.clone(), log.len() as u32 + 1))
                .collect(),
        )
    }

    /// First message of an origin the peer has never heard of
    pub fn first_gap(&self, theirs: &StatusVector) -> Option<&M> {
        self.messages
            .iter()
            .find(|(origin, _)| !theirs.contains(origin))
            .and_then(|(_, log)| log.first())
    }

    pub fn messages_from(&self, origin: &str) -> &[M] {
        self.messages.get(origin).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Last message of every origin
    pub fn latest(&self) -> Vec<M> {
        self.messages
            .values()
            .filter_map(|log| log.last().cloned())
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<M>> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
