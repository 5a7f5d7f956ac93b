//! Subscriber contract, post-block hooks and the tracker-side registration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::TrackerError;
use crate::types::{Block, BlockRef, Log, LogFilter};

/// A consumer of canonical logs with a rollback-aware lifecycle.
///
/// The tracker calls these methods strictly sequentially and never while a
/// subscriber could observe a half-updated cache. Implementations must not call
/// back into the tracker.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Seed state as of `block` (or the closest block the subscriber can
    /// justify). Returns the block the seeded state actually corresponds to.
    async fn initialize(&self, block: &BlockRef) -> Result<BlockRef, TrackerError>;

    /// Apply one log. Only called for logs in blocks after the seed block.
    async fn handle_log(&self, log: &Log) -> Result<(), TrackerError>;

    /// Discard state for blocks after `block.number`; `block` becomes the
    /// latest seen block.
    async fn rollback(&self, block: &BlockRef) -> Result<(), TrackerError>;
}

/// Called after each successful `handle_block`. Failures are logged and dropped.
#[async_trait]
pub trait BlockHook: Send + Sync {
    async fn on_block(&self, block: &Block, logs: &[Log]) -> Result<(), TrackerError>;
}

/// How far a subscriber's state has progressed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Block the subscriber's state was seeded at.
    pub initialized_at: Option<BlockRef>,
    /// Block of the most recent log or rollback applied.
    pub last_seen_event_block: Option<BlockRef>,
}

impl Watermarks {
    /// Returns `true` if logs in `block_number` may be delivered.
    pub fn accepts(&self, block_number: u64) -> bool {
        self.initialized_at
            .as_ref()
            .is_some_and(|seed| seed.number < block_number)
    }
}

/// A registered filter/subscriber pair plus its watermarks.
pub(crate) struct Registration {
    pub filter: LogFilter,
    pub subscriber: Arc<dyn Subscriber>,
    pub watermarks: Watermarks,
}

impl Registration {
    pub fn new(filter: LogFilter, subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            filter,
            subscriber,
            watermarks: Watermarks::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_accepts_nothing() {
        assert!(!Watermarks::default().accepts(10));
    }

    #[test]
    fn accepts_only_after_seed_block() {
        let wm = Watermarks {
            initialized_at: Some(BlockRef::new(5, "0x5")),
            last_seen_event_block: None,
        };
        assert!(!wm.accepts(5));
        assert!(wm.accepts(6));
    }
}
