//! EVM block source.
//!
//! Wraps an `EvmRpcClient` (`eth_getBlockByNumber`, `eth_getLogs`) and exposes
//! it as a [`BlockSource`]: log ranges are split into chunks the node accepts,
//! all registered filters are merged into one query, and logs flagged
//! `removed` are dropped.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use chainhead_core::error::TrackerError;
use chainhead_core::source::BlockSource;
use chainhead_core::types::{Block, Log, LogFilter};

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(rename = "data")]
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(rename = "removed")]
    pub removed: Option<bool>,
}

impl RawLog {
    /// Returns `true` if the node flagged this log as removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Decode the hex quantities into a [`Log`].
    pub fn to_log(&self) -> Result<Log, TrackerError> {
        let block_number = parse_hex_u64(&self.block_number).ok_or_else(|| {
            TrackerError::Source(format!("bad blockNumber in log: {}", self.block_number))
        })?;
        let log_index = parse_hex_u64(&self.log_index)
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| TrackerError::Source(format!("bad logIndex in log: {}", self.log_index)))?;
        Ok(Log {
            address: self.address.clone(),
            topics: self.topics.clone(),
            data: self.data.clone(),
            block_number,
            block_hash: self.block_hash.clone(),
            tx_hash: self.tx_hash.clone(),
            log_index,
        })
    }
}

/// One merged `eth_getLogs` query: any of `addresses`, and any of `topic0`
/// (empty = no topic restriction).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogQuery {
    pub addresses: Vec<String>,
    pub topic0: Vec<String>,
}

impl LogQuery {
    /// Union of the filters' addresses and topic0 lists. A filter without a
    /// topic restriction lifts the restriction for the whole query.
    pub fn merge(filters: &[LogFilter]) -> Self {
        let addresses: BTreeSet<String> = filters.iter().map(LogFilter::id).collect();
        let unrestricted = filters.iter().any(|f| f.topics.is_empty());
        let topic0: BTreeSet<String> = if unrestricted {
            BTreeSet::new()
        } else {
            filters
                .iter()
                .flat_map(|f| f.topics.iter().map(|t| t.to_ascii_lowercase()))
                .collect()
        };
        Self {
            addresses: addresses.into_iter().collect(),
            topic0: topic0.into_iter().collect(),
        }
    }
}

/// Trait for fetching EVM data from a JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, TrackerError>;
    async fn get_block(&self, number: u64) -> Result<Option<Block>, TrackerError>;
    /// Logs in the inclusive range `[from, to]`.
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        query: &LogQuery,
    ) -> Result<Vec<RawLog>, TrackerError>;
}

/// [`BlockSource`] over an EVM JSON-RPC client.
pub struct EvmBlockSource<C> {
    client: Arc<C>,
    max_log_range: u64,
}

impl<C: EvmRpcClient> EvmBlockSource<C> {
    /// `max_log_range` is the largest number of blocks asked for in one
    /// `eth_getLogs` call (at least 1).
    pub fn new(client: Arc<C>, max_log_range: u64) -> Self {
        Self {
            client,
            max_log_range: max_log_range.max(1),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Fetch raw logs in `[from, to]`, chunked by `max_log_range`.
    async fn raw_logs(&self, from: u64, to: u64, query: &LogQuery) -> Result<Vec<RawLog>, TrackerError> {
        let mut all_logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.max_log_range - 1).min(to);
            let chunk = self.client.get_logs(start, end, query).await?;
            debug!(from = start, to = end, logs = chunk.len(), "eth_getLogs chunk");
            all_logs.extend(chunk);
            start = end + 1;
        }
        Ok(all_logs)
    }
}

#[async_trait]
impl<C: EvmRpcClient> BlockSource for EvmBlockSource<C> {
    async fn get_block(&self, number: u64) -> Result<Block, TrackerError> {
        self.client
            .get_block(number)
            .await?
            .ok_or(TrackerError::BlockNotFound { number })
    }

    async fn fetch_logs(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
        filters: &[LogFilter],
    ) -> Result<Vec<Log>, TrackerError> {
        let query = LogQuery::merge(filters);
        let raw = self.raw_logs(from_exclusive + 1, to_inclusive, &query).await?;

        let mut logs = Vec::with_capacity(raw.len());
        for raw_log in raw.iter().filter(|l| !l.is_removed()) {
            let log = raw_log.to_log()?;
            if filters.iter().any(|f| f.matches(&log)) {
                logs.push(log);
            }
        }
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }
}

/// Parse a hex-encoded quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Convert an `eth_getBlockByNumber` JSON response into a [`Block`].
pub fn block_from_json(v: &Value) -> Option<Block> {
    Some(Block {
        number: parse_hex_u64(v["number"].as_str()?)?,
        hash: v["hash"].as_str()?.to_string(),
        parent_hash: v["parentHash"].as_str()?.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Scriptable RPC node.
    #[derive(Default)]
    pub(crate) struct MockRpc {
        pub blocks: Mutex<BTreeMap<u64, Block>>,
        pub logs: Mutex<Vec<RawLog>>,
        pub log_calls: Mutex<Vec<(u64, u64, LogQuery)>>,
    }

    impl MockRpc {
        pub fn with_blocks(blocks: impl IntoIterator<Item = Block>) -> Self {
            let rpc = Self::default();
            rpc.blocks
                .lock()
                .unwrap()
                .extend(blocks.into_iter().map(|b| (b.number, b)));
            rpc
        }

        pub fn ranges(&self) -> Vec<(u64, u64)> {
            self.log_calls.lock().unwrap().iter().map(|(f, t, _)| (*f, *t)).collect()
        }
    }

    #[async_trait]
    impl EvmRpcClient for MockRpc {
        async fn get_block_number(&self) -> Result<u64, TrackerError> {
            Ok(self.blocks.lock().unwrap().keys().next_back().copied().unwrap_or(0))
        }

        async fn get_block(&self, number: u64) -> Result<Option<Block>, TrackerError> {
            Ok(self.blocks.lock().unwrap().get(&number).cloned())
        }

        async fn get_logs(
            &self,
            from: u64,
            to: u64,
            query: &LogQuery,
        ) -> Result<Vec<RawLog>, TrackerError> {
            self.log_calls.lock().unwrap().push((from, to, query.clone()));
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|l| {
                    let n = parse_hex_u64(&l.block_number).unwrap_or(0);
                    n >= from && n <= to
                })
                .cloned()
                .collect())
        }
    }

    pub(crate) fn raw(address: &str, topic: &str, block: &Block, index: u32) -> RawLog {
        RawLog {
            address: address.into(),
            topics: vec![topic.into()],
            data: "0x".into(),
            block_number: format!("{:#x}", block.number),
            block_hash: block.hash.clone(),
            tx_hash: format!("0xtx{}{index}", block.number),
            log_index: format!("{index:#x}"),
            removed: None,
        }
    }

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn raw_log_decodes() {
        let block = Block::new(5_000_000_000, "0xb", "0xa");
        let log = raw("0xA", "0xddf2", &block, 5).to_log().unwrap();
        assert_eq!(log.block_number, 5_000_000_000);
        assert_eq!(log.log_index, 5);

        let mut bad = raw("0xA", "0xddf2", &block, 5);
        bad.block_number = "0xnope".into();
        assert!(bad.to_log().is_err());
    }

    #[test]
    fn block_from_json_reads_header() {
        let v = json!({
            "number": "0x10",
            "hash": "0xabc",
            "parentHash": "0xdef",
            "timestamp": "0x65",
        });
        assert_eq!(block_from_json(&v), Some(Block::new(16, "0xabc", "0xdef")));
        assert_eq!(block_from_json(&json!({ "number": "0x10" })), None);
    }

    #[test]
    fn merged_query_lifts_topic_restriction() {
        let restricted = LogFilter::address("0xA").topic0("0xDDF2");
        let q = LogQuery::merge(&[restricted.clone(), LogFilter::address("0xb").topic0("0x8c5b")]);
        assert_eq!(q.addresses, vec!["0xa", "0xb"]);
        assert_eq!(q.topic0, vec!["0x8c5b", "0xddf2"]);

        let q = LogQuery::merge(&[restricted, LogFilter::address("0xb")]);
        assert!(q.topic0.is_empty());
    }

    #[tokio::test]
    async fn log_range_is_chunked() {
        let rpc = Arc::new(MockRpc::default());
        let source = EvmBlockSource::new(rpc.clone(), 10);
        source.get_logs(0, 25, &[LogFilter::address("0xa")]).await.unwrap();
        assert_eq!(rpc.ranges(), vec![(1, 10), (11, 20), (21, 25)]);
    }

    #[tokio::test]
    async fn removed_and_unmatched_logs_dropped() {
        let b1 = Block::new(1, "0x1", "0x0");
        let b2 = Block::new(2, "0x2", "0x1");
        let rpc = Arc::new(MockRpc::with_blocks([b1.clone(), b2.clone()]));
        let mut removed = raw("0xa", "0xddf2", &b2, 0);
        removed.removed = Some(true);
        rpc.logs.lock().unwrap().extend([
            raw("0xa", "0xddf2", &b2, 3),
            raw("0xa", "0xddf2", &b1, 1),
            removed,
            raw("0xa", "0x8c5b", &b2, 1),
            raw("0xc", "0xddf2", &b2, 2),
        ]);

        let source = EvmBlockSource::new(rpc, 100);
        let logs = source
            .get_logs(0, 2, &[LogFilter::address("0xA").topic0("0xddf2")])
            .await
            .unwrap();
        let keys: Vec<(u64, u32)> = logs.iter().map(|l| (l.block_number, l.log_index)).collect();
        assert_eq!(keys, vec![(1, 1), (2, 3)]);
    }

    #[tokio::test]
    async fn missing_block_is_not_found() {
        let source = EvmBlockSource::new(Arc::new(MockRpc::default()), 100);
        let err = source.get_block(7).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
