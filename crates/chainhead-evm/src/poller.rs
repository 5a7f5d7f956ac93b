//! Head poller: the HTTP-polling block feed.
//!
//! Polls `eth_blockNumber` every `poll_interval_ms`, fetches the header at the
//! reported height and pushes it into a [`FeedHandle`] whenever the head hash
//! changes. Gaps and reorgs are left to the tracker; the poller only reports
//! what the node currently calls its head.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use chainhead_core::dispatcher::FeedHandle;
use chainhead_core::error::TrackerError;
use chainhead_core::types::Block;

use crate::fetcher::EvmRpcClient;

/// Polling feed configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Delay between head polls.
    pub poll_interval_ms: u64,
    /// Largest block span per `eth_getLogs` call.
    pub max_log_range: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_log_range: 2000,
        }
    }
}

/// Pushes new chain heads observed over JSON-RPC into a feed.
pub struct BlockPoller<C> {
    client: Arc<C>,
    config: PollConfig,
    last: Option<Block>,
}

impl<C: EvmRpcClient> BlockPoller<C> {
    pub fn new(client: Arc<C>, config: PollConfig) -> Self {
        Self {
            client,
            config,
            last: None,
        }
    }

    /// Last head pushed into the feed.
    pub fn last_pushed(&self) -> Option<&Block> {
        self.last.as_ref()
    }

    /// One poll. Returns the block pushed, if the head changed.
    pub async fn tick(&mut self, feed: &FeedHandle) -> Result<Option<Block>, TrackerError> {
        let number = self.client.get_block_number().await?;
        let Some(head) = self.client.get_block(number).await? else {
            debug!(number, "Head block not yet available");
            return Ok(None);
        };
        if self.last.as_ref().is_some_and(|last| last.hash == head.hash) {
            return Ok(None);
        }
        debug!(number = head.number, hash = %head.hash, "New head observed");
        feed.push(head.clone())?;
        self.last = Some(head.clone());
        Ok(Some(head))
    }

    /// Poll until the feed closes. RPC errors are logged and the next poll
    /// proceeds as normal.
    pub async fn run(mut self, feed: FeedHandle) {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(poll_interval_ms = self.config.poll_interval_ms, "Head poller started");
        while !feed.is_closed() {
            if let Err(e) = self.tick(&feed).await {
                warn!(error = %e, "Head poll failed");
            }
            tokio::time::sleep(interval).await;
        }
        info!("Feed closed; head poller stopped");
    }
}
