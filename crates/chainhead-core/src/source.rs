//! Block source: where the tracker fetches blocks and logs from.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::TrackerError;
use crate::types::{Block, Log, LogFilter};

/// Supplies canonical blocks and logs. Implementations are responsible for
/// their own per-call timeouts.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the canonical block at `number`.
    async fn get_block(&self, number: u64) -> Result<Block, TrackerError>;

    /// Fetch logs in `(from_exclusive, to_inclusive]` matching any of `filters`.
    /// `filters` is never empty and the range is never empty.
    async fn fetch_logs(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
        filters: &[LogFilter],
    ) -> Result<Vec<Log>, TrackerError>;

    /// Fetch logs, short-circuiting to an empty result when there is nothing to ask for.
    async fn get_logs(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
        filters: &[LogFilter],
    ) -> Result<Vec<Log>, TrackerError> {
        if filters.is_empty() || to_inclusive <= from_exclusive {
            return Ok(vec![]);
        }
        self.fetch_logs(from_exclusive, to_inclusive, filters).await
    }
}

// ─── In-memory source (for testing) ───────────────────────────────────────────

#[derive(Default)]
struct MemoryChain {
    blocks: BTreeMap<u64, Block>,
    logs: Vec<Log>,
    fail_get_block: u32,
    fail_get_logs: u32,
    get_block_calls: u64,
    get_logs_calls: u64,
}

/// In-memory block source for tests, demos and replays.
///
/// The chain can be rewritten at any time to simulate a fork, and transient
/// failures can be injected for the next N calls.
#[derive(Default)]
pub struct MemoryBlockSource {
    chain: Mutex<MemoryChain>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from a chain of blocks and its logs.
    pub fn with_chain(blocks: impl IntoIterator<Item = Block>, logs: impl IntoIterator<Item = Log>) -> Self {
        let source = Self::new();
        for block in blocks {
            source.push_block(block);
        }
        for log in logs {
            source.push_log(log);
        }
        source
    }

    /// Insert or overwrite the canonical block at `block.number`.
    pub fn push_block(&self, block: Block) {
        self.chain.lock().unwrap().blocks.insert(block.number, block);
    }

    pub fn push_log(&self, log: Log) {
        self.chain.lock().unwrap().logs.push(log);
    }

    /// Replace the chain from `number` upward (blocks and logs) with a fork.
    pub fn replace_from(&self, number: u64, blocks: Vec<Block>, logs: Vec<Log>) {
        let mut chain = self.chain.lock().unwrap();
        chain.blocks.retain(|n, _| *n < number);
        chain.logs.retain(|l| l.block_number < number);
        for block in blocks {
            chain.blocks.insert(block.number, block);
        }
        chain.logs.extend(logs);
    }

    /// Make the next `n` `get_block` calls fail.
    pub fn fail_get_block(&self, n: u32) {
        self.chain.lock().unwrap().fail_get_block = n;
    }

    /// Make the next `n` log queries fail.
    pub fn fail_get_logs(&self, n: u32) {
        self.chain.lock().unwrap().fail_get_logs = n;
    }

    pub fn get_block_calls(&self) -> u64 {
        self.chain.lock().unwrap().get_block_calls
    }

    pub fn get_logs_calls(&self) -> u64 {
        self.chain.lock().unwrap().get_logs_calls
    }

    /// Highest canonical block.
    pub fn head(&self) -> Option<Block> {
        self.chain.lock().unwrap().blocks.values().next_back().cloned()
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn get_block(&self, number: u64) -> Result<Block, TrackerError> {
        let mut chain = self.chain.lock().unwrap();
        chain.get_block_calls += 1;
        if chain.fail_get_block > 0 {
            chain.fail_get_block -= 1;
            return Err(TrackerError::BlockNotFound { number });
        }
        chain
            .blocks
            .get(&number)
            .cloned()
            .ok_or(TrackerError::BlockNotFound { number })
    }

    async fn fetch_logs(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
        filters: &[LogFilter],
    ) -> Result<Vec<Log>, TrackerError> {
        let mut chain = self.chain.lock().unwrap();
        chain.get_logs_calls += 1;
        if chain.fail_get_logs > 0 {
            chain.fail_get_logs -= 1;
            return Err(TrackerError::Source("injected log failure".into()));
        }
        let mut logs: Vec<Log> = chain
            .logs
            .iter()
            .filter(|l| l.block_number > from_exclusive && l.block_number <= to_inclusive)
            .filter(|l| filters.iter().any(|f| f.matches(l)))
            .cloned()
            .collect();
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(address: &str, block: &Block, index: u32) -> Log {
        Log {
            address: address.into(),
            topics: vec!["0xddf2".into()],
            data: "0x".into(),
            block_number: block.number,
            block_hash: block.hash.clone(),
            tx_hash: format!("0xtx{index}"),
            log_index: index,
        }
    }

    #[tokio::test]
    async fn empty_filters_short_circuit() {
        let source = MemoryBlockSource::new();
        source.fail_get_logs(1);
        let logs = source.get_logs(0, 10, &[]).await.unwrap();
        assert!(logs.is_empty());
        assert_eq!(source.get_logs_calls(), 0);
    }

    #[tokio::test]
    async fn range_is_exclusive_inclusive() {
        let b1 = Block::new(1, "0x1", "0x0");
        let b2 = Block::new(2, "0x2", "0x1");
        let source = MemoryBlockSource::with_chain(
            [b1.clone(), b2.clone()],
            [log("0xa", &b1, 0), log("0xa", &b2, 0), log("0xb", &b2, 1)],
        );
        let logs = source.get_logs(1, 2, &[LogFilter::address("0xA")]).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 2);
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let source = MemoryBlockSource::with_chain([Block::new(1, "0x1", "0x0")], []);
        source.fail_get_block(2);
        assert!(source.get_block(1).await.is_err());
        assert!(source.get_block(1).await.is_err());
        assert_eq!(source.get_block(1).await.unwrap().hash, "0x1");
        assert_eq!(source.get_block_calls(), 3);
    }

    #[tokio::test]
    async fn replace_from_rewrites_suffix() {
        let b1 = Block::new(1, "0x1", "0x0");
        let b2 = Block::new(2, "0x2", "0x1");
        let source = MemoryBlockSource::with_chain([b1, b2.clone()], [log("0xa", &b2, 0)]);
        let b2c = Block::new(2, "0x2c", "0x1");
        source.replace_from(2, vec![b2c.clone()], vec![]);
        assert_eq!(source.get_block(2).await.unwrap(), b2c);
        assert!(source.get_logs(1, 2, &[LogFilter::address("0xa")]).await.unwrap().is_empty());
        assert_eq!(source.head().unwrap().hash, "0x2c");
    }
}
