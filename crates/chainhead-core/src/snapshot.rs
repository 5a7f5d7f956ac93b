//! State snapshot cache: a generic subscriber that keeps one state value per
//! block number.
//!
//! The owner supplies how state is seeded ([`StateHandler::state_initialize`]),
//! how one log transforms it ([`StateHandler::state_handle_log`]) and how it is
//! copied ([`StateHandler::fork_state`]). The cache forks a fresh copy the first
//! time a block number receives a log, so snapshots for different blocks never
//! alias, and a rollback is a truncation of the snapshot map.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::TrackerError;
use crate::subscriber::Subscriber;
use crate::types::{BlockRef, Log};

/// Domain hooks for a [`SnapshotCache`].
#[async_trait]
pub trait StateHandler: Send + Sync {
    type State: Clone + Send + Sync;

    /// Build the state as of `block`, returning the block it corresponds to.
    async fn state_initialize(
        &self,
        block: &BlockRef,
    ) -> Result<(Self::State, BlockRef), TrackerError>;

    /// Apply one log. Must be free of side effects.
    fn state_handle_log(&self, state: Self::State, log: &Log) -> Self::State;

    /// Copy a snapshot before it is modified for a newer block.
    fn fork_state(&self, state: &Self::State) -> Self::State {
        state.clone()
    }
}

struct Snapshots<S> {
    states: BTreeMap<u64, S>,
    last_seen: Option<BlockRef>,
}

impl<S> Snapshots<S> {
    /// The snapshot in effect at `number`: the newest one at or below it.
    fn floor(&self, number: u64) -> Option<&S> {
        self.states.range(..=number).next_back().map(|(_, s)| s)
    }
}

/// Per-block state snapshots with copy-on-write forking and rollback by truncation.
pub struct SnapshotCache<H: StateHandler> {
    handler: H,
    inner: Mutex<Snapshots<H::State>>,
}

impl<H: StateHandler> SnapshotCache<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            inner: Mutex::new(Snapshots {
                states: BTreeMap::new(),
                last_seen: None,
            }),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The authoritative current state (as of the last seen event block).
    pub async fn current_state(&self) -> Option<H::State> {
        let inner = self.inner.lock().await;
        let last = inner.last_seen.as_ref()?;
        inner.floor(last.number).map(|s| self.handler.fork_state(s))
    }

    /// A copy of the state as of block `number`.
    pub async fn state_at(&self, number: u64) -> Option<H::State> {
        let inner = self.inner.lock().await;
        inner.floor(number).map(|s| self.handler.fork_state(s))
    }

    pub async fn last_seen_event_block(&self) -> Option<BlockRef> {
        self.inner.lock().await.last_seen.clone()
    }

    /// Block numbers that currently hold a snapshot, ascending.
    pub async fn snapshot_numbers(&self) -> Vec<u64> {
        self.inner.lock().await.states.keys().copied().collect()
    }
}

#[async_trait]
impl<H: StateHandler> Subscriber for SnapshotCache<H> {
    async fn initialize(&self, block: &BlockRef) -> Result<BlockRef, TrackerError> {
        let mut inner = self.inner.lock().await;
        let (state, seed) = self.handler.state_initialize(block).await?;
        inner.states.clear();
        inner.states.insert(seed.number, state);
        inner.last_seen = Some(seed.clone());
        tracing::debug!(number = seed.number, hash = %seed.hash, "State snapshot seeded");
        Ok(seed)
    }

    async fn handle_log(&self, log: &Log) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock().await;
        let last = inner
            .last_seen
            .clone()
            .ok_or_else(|| TrackerError::Other("state snapshot not initialized".into()))?;
        let number = log.block_number;
        if number < last.number {
            return Err(TrackerError::Other(format!(
                "log in block {number} precedes latest snapshot at {}",
                last.number
            )));
        }

        let state = match inner.states.remove(&number) {
            Some(state) => state,
            None => {
                let base = inner.floor(last.number).ok_or_else(|| {
                    TrackerError::Other(format!("no snapshot at or below block {}", last.number))
                })?;
                self.handler.fork_state(base)
            }
        };
        let next = self.handler.state_handle_log(state, log);
        inner.states.insert(number, next);
        inner.last_seen = Some(log.block());
        Ok(())
    }

    async fn rollback(&self, block: &BlockRef) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock().await;
        let dropped = match block.number.checked_add(1) {
            Some(next) => inner.states.split_off(&next),
            None => BTreeMap::new(),
        };
        inner.last_seen = Some(block.clone());
        tracing::debug!(
            to = block.number,
            dropped = dropped.len(),
            "State snapshots rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records `block:index` for every applied log.
    struct Counter;

    #[async_trait]
    impl StateHandler for Counter {
        type State = Vec<String>;

        async fn state_initialize(
            &self,
            block: &BlockRef,
        ) -> Result<(Self::State, BlockRef), TrackerError> {
            Ok((vec![], block.clone()))
        }

        fn state_handle_log(&self, mut state: Self::State, log: &Log) -> Self::State {
            state.push(format!("{}:{}", log.block_number, log.log_index));
            state
        }
    }

    fn log(block: u64, index: u32) -> Log {
        Log {
            address: "0xa".into(),
            topics: vec![],
            data: "0x".into(),
            block_number: block,
            block_hash: format!("0x{block}"),
            tx_hash: "0xt".into(),
            log_index: index,
        }
    }

    #[tokio::test]
    async fn forks_per_block_without_aliasing() {
        let cache = SnapshotCache::new(Counter);
        cache.initialize(&BlockRef::new(1, "0x1")).await.unwrap();
        cache.handle_log(&log(2, 0)).await.unwrap();
        cache.handle_log(&log(2, 1)).await.unwrap();
        cache.handle_log(&log(3, 0)).await.unwrap();

        assert_eq!(cache.snapshot_numbers().await, vec![1, 2, 3]);
        assert!(cache.state_at(1).await.unwrap().is_empty());
        assert_eq!(cache.state_at(2).await.unwrap(), vec!["2:0", "2:1"]);
        assert_eq!(cache.current_state().await.unwrap(), vec!["2:0", "2:1", "3:0"]);
        assert_eq!(cache.last_seen_event_block().await.unwrap(), BlockRef::new(3, "0x3"));
    }

    #[tokio::test]
    async fn rollback_truncates_newer_snapshots() {
        let cache = SnapshotCache::new(Counter);
        cache.initialize(&BlockRef::new(1, "0x1")).await.unwrap();
        cache.handle_log(&log(2, 0)).await.unwrap();
        cache.handle_log(&log(3, 0)).await.unwrap();

        cache.rollback(&BlockRef::new(1, "0x1")).await.unwrap();

        assert_eq!(cache.snapshot_numbers().await, vec![1]);
        assert_eq!(cache.last_seen_event_block().await.unwrap().number, 1);
        assert!(cache.current_state().await.unwrap().is_empty());

        // Replaying a different block 2 forks from block 1 again.
        cache.handle_log(&log(2, 5)).await.unwrap();
        assert_eq!(cache.current_state().await.unwrap(), vec!["2:5"]);
    }

    #[tokio::test]
    async fn rollback_between_snapshots_keeps_floor_state() {
        let cache = SnapshotCache::new(Counter);
        cache.initialize(&BlockRef::new(1, "0x1")).await.unwrap();
        cache.handle_log(&log(4, 0)).await.unwrap();
        cache.rollback(&BlockRef::new(3, "0x3")).await.unwrap();
        assert_eq!(cache.snapshot_numbers().await, vec![1]);
        assert!(cache.current_state().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_to_highest_block_number_keeps_everything() {
        let cache = SnapshotCache::new(Counter);
        cache.initialize(&BlockRef::new(u64::MAX - 1, "0xa")).await.unwrap();
        cache.handle_log(&log(u64::MAX, 0)).await.unwrap();
        cache.rollback(&BlockRef::new(u64::MAX, "0xb")).await.unwrap();
        assert_eq!(cache.snapshot_numbers().await, vec![u64::MAX - 1, u64::MAX]);
        assert_eq!(cache.current_state().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handle_log_requires_initialization() {
        let cache = SnapshotCache::new(Counter);
        assert!(cache.handle_log(&log(2, 0)).await.is_err());
    }

    #[tokio::test]
    async fn out_of_order_log_rejected() {
        let cache = SnapshotCache::new(Counter);
        cache.initialize(&BlockRef::new(5, "0x5")).await.unwrap();
        cache.handle_log(&log(6, 0)).await.unwrap();
        assert!(cache.handle_log(&log(4, 0)).await.is_err());
    }

    #[tokio::test]
    async fn reinitialize_discards_previous_snapshots() {
        let cache = SnapshotCache::new(Counter);
        cache.initialize(&BlockRef::new(1, "0x1")).await.unwrap();
        cache.handle_log(&log(2, 0)).await.unwrap();
        cache.initialize(&BlockRef::new(10, "0x10")).await.unwrap();
        assert_eq!(cache.snapshot_numbers().await, vec![10]);
    }
}
