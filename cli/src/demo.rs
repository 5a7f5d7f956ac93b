//! `chainhead demo`: replay a scripted fork against the in-memory source.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use chainhead_core::{
    Block, BlockOutcome, BlockRef, ChainTracker, Log, LogFilter, MemoryBlockSource, SnapshotCache,
    StateHandler, TrackerConfig, TrackerError,
};

use crate::logging::LogConfig;

const TOKEN: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
const TRANSFER: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Contents of `--config <file>`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub tracker: TrackerConfig,
    pub log: LogConfig,
}

impl DemoConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Counts transfers per block height.
struct TransferCount;

#[async_trait]
impl StateHandler for TransferCount {
    type State = u64;

    async fn state_initialize(&self, block: &BlockRef) -> Result<(u64, BlockRef), TrackerError> {
        Ok((0, block.clone()))
    }

    fn state_handle_log(&self, count: u64, _log: &Log) -> u64 {
        count + 1
    }
}

fn fork(tag: &str, from: u64, to: u64, parent: &str) -> Vec<Block> {
    let mut prev = parent.to_string();
    (from..=to)
        .map(|n| {
            let b = Block::new(n, format!("0x{tag}{n:02}"), prev.clone());
            prev = b.hash.clone();
            b
        })
        .collect()
}

fn transfers(blocks: &[Block], per_block: u32) -> Vec<Log> {
    blocks
        .iter()
        .flat_map(|b| {
            (0..per_block).map(move |i| Log {
                address: TOKEN.into(),
                topics: vec![TRANSFER.into()],
                data: "0x".into(),
                block_number: b.number,
                block_hash: b.hash.clone(),
                tx_hash: format!("{}{i:02}", b.hash),
                log_index: i,
            })
        })
        .collect()
}

fn report(label: &str, block: &Block, outcome: &BlockOutcome) {
    let rollback = outcome
        .rollback
        .as_ref()
        .map_or("-".to_string(), |b| format!("#{} {}", b.number, b.hash));
    println!(
        "{label:<10} #{:<3} {}  logs={:<2} rollback={rollback}",
        block.number,
        block.hash,
        outcome.logs.len()
    );
}

pub async fn run(config: DemoConfig) -> Result<()> {
    let canonical = fork("a", 1, 5, "0x00");
    let source = Arc::new(MemoryBlockSource::with_chain(
        canonical.clone(),
        transfers(&canonical[1..], 2),
    ));
    let tracker = ChainTracker::new(source.clone(), config.tracker)?;
    tracker.initialize(canonical[0].clone()).await;

    let counter = Arc::new(SnapshotCache::new(TransferCount));
    tracker
        .subscribe(LogFilter::address(TOKEN).topic0(TRANSFER), counter.clone())
        .await?;

    for block in &canonical[1..4] {
        let outcome = tracker.handle_block(block.clone()).await?;
        report("extend", block, &outcome);
    }

    // Blocks 3 and 4 are replaced; the feed skips straight to the new #5.
    let side = fork("b", 3, 5, &canonical[1].hash);
    source.replace_from(3, side.clone(), transfers(&side, 1));
    info!(from = 3, "Switched source to side chain");

    let tip = &side[2];
    let outcome = tracker.handle_block(tip.clone()).await?;
    report("reorg", tip, &outcome);

    // Re-delivery is a no-op.
    let outcome = tracker.handle_block(tip.clone()).await?;
    report("duplicate", tip, &outcome);

    let head = tracker.head().await.context("tracker lost its head")?;
    println!();
    println!("head       #{} {}", head.number, head.hash);
    println!("cached     {} blocks", tracker.cached_len().await);
    println!(
        "transfers  {} (snapshots at {:?})",
        counter.current_state().await.unwrap_or_default(),
        counter.snapshot_numbers().await
    );
    Ok(())
}
