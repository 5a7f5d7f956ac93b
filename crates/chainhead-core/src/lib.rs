//! chainhead-core: reorg-aware chain head tracking with consistent log delivery.
//!
//! # Architecture
//!
//! ```text
//! FeedDispatcher ──► ChainTracker ──► Subscriber (e.g. SnapshotCache)
//!                        │  ├── BlockCache   (bounded window, parent-hash linked)
//!                        │  ├── registry     (filter id → subscriber + watermarks)
//!                        │  └── RetryPolicy  (fixed delay, bounded budgets)
//!                        └──► BlockSource    (get_block / get_logs)
//! ```
//!
//! Subscribers never keep events from blocks that turn out not to be canonical:
//! when a reorg is repaired they are rolled back to the common ancestor, and
//! when the reorg is deeper than the window the tracker re-initializes at the
//! new block and reports it as the rollback point.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod snapshot;
pub mod source;
pub mod subscriber;
pub mod tracker;
pub mod types;

pub use cache::BlockCache;
pub use config::{TrackerBuilder, TrackerConfig};
pub use dispatcher::{FeedDispatcher, FeedEvent, FeedEvents, FeedHandle, FeedStats};
pub use error::{RetryStage, TrackerError};
pub use retry::RetryPolicy;
pub use snapshot::{SnapshotCache, StateHandler};
pub use source::{BlockSource, MemoryBlockSource};
pub use subscriber::{BlockHook, Subscriber, Watermarks};
pub use tracker::ChainTracker;
pub use types::{Block, BlockOutcome, BlockRef, Log, LogFilter};
