//! Feed dispatcher: turns a bursty block feed (WebSocket push, HTTP poll)
//! into strictly sequential `handle_block` calls.
//!
//! Blocks are queued on an unbounded channel and drained by a single task, so
//! one call always completes before the next begins and arrival order is kept
//! even when the transport delivers a burst mid-call.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::TrackerError;
use crate::source::BlockSource;
use crate::tracker::ChainTracker;
use crate::types::{Block, BlockOutcome};

/// What happened to one dispatched block.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Processed { block: Block, outcome: BlockOutcome },
    Failed { block: Block, error: TrackerError },
}

/// Counters returned when the dispatcher task ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub processed: u64,
    pub rollbacks: u64,
    pub failed: u64,
}

/// Receiving side of the dispatcher's event stream.
pub type FeedEvents = mpsc::UnboundedReceiver<FeedEvent>;

/// Cloneable handle for pushing observed blocks into the dispatcher.
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::UnboundedSender<Block>,
}

impl FeedHandle {
    /// Queue a newly observed block.
    pub fn push(&self, block: Block) -> Result<(), TrackerError> {
        self.tx.send(block).map_err(|e| {
            TrackerError::Other(format!("feed closed, dropped block {}", e.0.number))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns the task that feeds a [`ChainTracker`].
pub struct FeedDispatcher;

impl FeedDispatcher {
    /// Start draining. The task ends once every [`FeedHandle`] is dropped and
    /// the queue is empty.
    pub fn spawn<S: BlockSource + 'static>(
        tracker: Arc<ChainTracker<S>>,
    ) -> (FeedHandle, FeedEvents, JoinHandle<FeedStats>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drain(tracker, rx, events_tx));
        (FeedHandle { tx }, events_rx, task)
    }
}

async fn drain<S: BlockSource>(
    tracker: Arc<ChainTracker<S>>,
    mut rx: mpsc::UnboundedReceiver<Block>,
    events: mpsc::UnboundedSender<FeedEvent>,
) -> FeedStats {
    let mut stats = FeedStats::default();
    while let Some(block) = rx.recv().await {
        let event = match tracker.handle_block(block.clone()).await {
            Ok(outcome) => {
                stats.processed += 1;
                if outcome.is_rollback() {
                    stats.rollbacks += 1;
                }
                FeedEvent::Processed { block, outcome }
            }
            Err(error) => {
                stats.failed += 1;
                warn!(number = block.number, hash = %block.hash, error = %error, "Block processing failed");
                FeedEvent::Failed { block, error }
            }
        };
        // Nobody listening is not an error.
        let _ = events.send(event);
    }
    info!(
        processed = stats.processed,
        rollbacks = stats.rollbacks,
        failed = stats.failed,
        "Feed closed"
    );
    stats
}
