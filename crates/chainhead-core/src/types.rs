//! Shared types: blocks, logs and log filters.

use serde::{Deserialize, Serialize};

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block header reduced to its linkage: number, hash and parent hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
}

impl Block {
    pub fn new(number: u64, hash: impl Into<String>, parent_hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
            parent_hash: parent_hash.into(),
        }
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }

    /// The block without its parent linkage.
    pub fn to_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash.clone(),
        }
    }
}

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// A block identified by number and hash only, used where parent linkage is
/// irrelevant (subscriber seed points, watermarks).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
}

impl BlockRef {
    pub fn new(number: u64, hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
        }
    }
}

impl From<&Block> for BlockRef {
    fn from(block: &Block) -> Self {
        block.to_ref()
    }
}

// ─── Log ──────────────────────────────────────────────────────────────────────

/// An emitted event log, tagged with the block it was reported in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Contract address that emitted the log.
    pub address: String,
    /// Indexed topics; `topics[0]` is the event signature hash.
    pub topics: Vec<String>,
    /// Non-indexed payload (`0x…`).
    pub data: String,
    pub block_number: u64,
    /// Hash of the block the source reported this log in.
    pub block_hash: String,
    pub tx_hash: String,
    pub log_index: u32,
}

impl Log {
    /// The block this log was reported in.
    pub fn block(&self) -> BlockRef {
        BlockRef::new(self.block_number, self.block_hash.clone())
    }

    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

// ─── LogFilter ────────────────────────────────────────────────────────────────

/// Which logs a subscriber is interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Contract address. Also the identity of the subscription.
    pub address: String,
    /// Allowed topic0 values (empty = all events from `address`).
    pub topics: Vec<String>,
}

impl LogFilter {
    /// Create a filter for a single contract address.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            address: addr.into(),
            topics: vec![],
        }
    }

    /// Add a topic0 filter (event signature hash).
    pub fn topic0(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Registration key; at most one subscriber per id.
    pub fn id(&self) -> String {
        self.address.to_ascii_lowercase()
    }

    /// Returns `true` if `log` was emitted by this address with an allowed topic0.
    pub fn matches(&self, log: &Log) -> bool {
        if !self.address.eq_ignore_ascii_case(&log.address) {
            return false;
        }
        self.topics.is_empty()
            || log
                .topic0()
                .is_some_and(|t0| self.topics.iter().any(|t| t.eq_ignore_ascii_case(t0)))
    }
}

// ─── BlockOutcome ─────────────────────────────────────────────────────────────

/// Result of one `handle_block` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    /// Logs accepted for the new canonical range, in source order.
    pub logs: Vec<Log>,
    /// Set when previously delivered data must be retracted: the common
    /// ancestor after a repaired reorg, or the new block itself after a
    /// reorg deeper than the cache window.
    pub rollback: Option<Block>,
}

impl BlockOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback.is_some()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn log(address: &str, topic0: &str) -> Log {
        Log {
            address: address.into(),
            topics: vec![topic0.into()],
            data: "0x".into(),
            block_number: 1,
            block_hash: "0x1".into(),
            tx_hash: "0xt".into(),
            log_index: 0,
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = Block::new(100, "0xaaa", "0x000");
        let child = Block::new(101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = Block::new(100, "0xaaa", "0x000");
        let b = Block::new(102, "0xccc", "0xaaa");
        assert!(!b.extends(&a));
    }

    #[test]
    fn filter_matches_address_case_insensitive() {
        let f = LogFilter::address("0xAbCdEf");
        assert!(f.matches(&log("0xabcdef", "0xddf2")));
        assert!(!f.matches(&log("0x111111", "0xddf2")));
        assert_eq!(f.id(), "0xabcdef");
    }

    #[test]
    fn filter_topic_allow_list() {
        let f = LogFilter::address("0xabc").topic0("0xDDF2");
        assert!(f.matches(&log("0xabc", "0xddf2")));
        assert!(!f.matches(&log("0xabc", "0x8c5b")));
    }
}
