//! Chain tracker: follows the canonical head, repairs reorgs and delivers
//! logs to subscribers.
//!
//! Every public operation runs inside one exclusive section (a tokio mutex held
//! for the whole body), so the multi-step read-modify-write sequences against the
//! cache and the subscriber registry never interleave across `await` points.
//!
//! # `handle_block` in brief
//!
//! ```text
//! duplicate? ──yes──► empty outcome
//!     │no
//! initialize pending subscribers at the new block
//!     │
//! extends head? ──yes──► push to cache
//!     │no
//! find common ancestor (re-fetching cached blocks) ──none──► resync at new block
//!     │found                         ──at or above the new block──► stale, ignore
//!     │
//! rewind to ancestor, re-link missing blocks up to the new block
//!     │
//! fetch logs (delivered cursor, head] ──log hash ≠ cache──► repair again, refetch
//!     │
//! roll back subscribers above the ancestor, deliver logs, retry pending initialization
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::BlockCache;
use crate::config::TrackerConfig;
use crate::error::{RetryStage, TrackerError};
use crate::source::BlockSource;
use crate::subscriber::{BlockHook, Registration, Subscriber, Watermarks};
use crate::types::{Block, BlockOutcome, BlockRef, Log, LogFilter};

/// Everything guarded by the tracker's exclusive section.
struct TrackerState {
    cache: BlockCache,
    registry: HashMap<String, Registration>,
    /// Subscribers awaiting (re)initialization.
    pending: HashSet<String>,
    hooks: Vec<Arc<dyn BlockHook>>,
    /// Logs for blocks up to and including this number have been delivered.
    delivered: u64,
    /// Rollback established by a reorg but not yet reported in an outcome.
    pending_rollback: Option<Block>,
}

impl TrackerState {
    fn mark_pending(&mut self, id: &str) {
        if let Some(reg) = self.registry.get_mut(id) {
            reg.watermarks = Watermarks::default();
        }
        self.pending.insert(id.to_string());
    }

    fn filters(&self) -> Vec<LogFilter> {
        self.registry.values().map(|r| r.filter.clone()).collect()
    }
}

/// Result of the reorg path.
enum Reorg {
    /// The cache was re-linked from `ancestor` up to the target block.
    Repaired { ancestor: Block },
    /// The common ancestor lies outside the cache window.
    Resync,
    /// The cached chain is canonical at or above the target's height; the
    /// target is an uncle or a lagging re-announcement.
    Stale,
}

/// Result of log retrieval.
enum LogFetch {
    Logs(Vec<Log>),
    /// A mid-fetch reorg went deeper than the window; resync at this block.
    Resync(Block),
}

/// Why one chain-repair attempt failed.
enum RepairFailure {
    Fetch(TrackerError),
    /// A fetched block did not link to the cache head.
    Unlinked { number: u64 },
}

/// Reorg-aware head tracker over a [`BlockSource`].
pub struct ChainTracker<S> {
    source: Arc<S>,
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl<S: BlockSource> ChainTracker<S> {
    pub fn new(source: Arc<S>, config: TrackerConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        Ok(Self {
            source,
            state: Mutex::new(TrackerState {
                cache: BlockCache::new(config.max_block_cached),
                registry: HashMap::new(),
                pending: HashSet::new(),
                hooks: vec![],
                delivered: 0,
                pending_rollback: None,
            }),
            config,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    // ─── Public operations ───────────────────────────────────────────────────

    /// Hard-reset the cache to `block` and re-initialize every subscriber there.
    ///
    /// Subscriber failures are not returned; those subscribers stay pending and
    /// are retried on later calls.
    pub async fn initialize(&self, block: Block) {
        let mut state = self.state.lock().await;
        info!(number = block.number, hash = %block.hash, "Tracker initialized");
        self.reset(&mut state, block).await;
    }

    /// Register `subscriber` under `filter`, replacing any subscriber with the
    /// same identity, and try to initialize it at the current head.
    pub async fn subscribe(
        &self,
        filter: LogFilter,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.lock().await;
        let head = state
            .cache
            .head()
            .map(Block::to_ref)
            .ok_or(TrackerError::NotInitialized)?;

        let id = filter.id();
        let replaced = state
            .registry
            .insert(id.clone(), Registration::new(filter, subscriber))
            .is_some();
        info!(subscriber = %id, replaced, "Subscriber registered");
        state.pending.insert(id);
        self.initialize_pending(&mut state, &head).await;
        Ok(())
    }

    /// Remove a registration. Returns `true` if one existed.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let id = id.to_ascii_lowercase();
        state.pending.remove(&id);
        state.registry.remove(&id).is_some()
    }

    /// Register a hook run (detached) after every successful `handle_block`.
    pub async fn add_block_hook(&self, hook: Arc<dyn BlockHook>) {
        self.state.lock().await.hooks.push(hook);
    }

    /// Process one observed block.
    pub async fn handle_block(&self, new_block: Block) -> Result<BlockOutcome, TrackerError> {
        let mut state = self.state.lock().await;
        let previous_head = state
            .cache
            .head()
            .cloned()
            .ok_or(TrackerError::NotInitialized)?;

        if state.cache.contains(&new_block) {
            debug!(number = new_block.number, hash = %new_block.hash, "Block already cached");
            return Ok(BlockOutcome::empty());
        }

        let seeded = self.initialize_pending(&mut state, &new_block.to_ref()).await;

        if new_block.extends(&previous_head) {
            state.cache.push(new_block.clone());
            debug!(number = new_block.number, hash = %new_block.hash, "Head extended");
        } else {
            warn!(
                number = new_block.number,
                hash = %new_block.hash,
                parent_hash = %new_block.parent_hash,
                head = previous_head.number,
                head_hash = %previous_head.hash,
                "Reorg detected"
            );
            match self.reorg(&mut state, &new_block).await? {
                Reorg::Repaired { ancestor } => {
                    debug!(ancestor = ancestor.number, head = new_block.number, "Cache re-linked");
                }
                Reorg::Resync => return Ok(self.resync(&mut state, new_block).await),
                Reorg::Stale => {
                    self.skip_stale(&mut state, &new_block, &seeded).await;
                    return Ok(BlockOutcome::empty());
                }
            }
        }

        let logs = match self.fetch_logs(&mut state).await? {
            LogFetch::Logs(logs) => logs,
            LogFetch::Resync(block) => return Ok(self.resync(&mut state, block).await),
        };

        let rollback = state.pending_rollback.take();
        if let Some(ancestor) = &rollback {
            self.rollback_subscribers(&mut state, ancestor).await;
        }
        self.deliver(&mut state, &logs).await;

        let head = state.cache.head().cloned().unwrap_or(new_block);
        state.delivered = head.number;
        self.initialize_pending(&mut state, &head.to_ref()).await;
        self.fire_hooks(&state, &head, &logs);

        Ok(BlockOutcome { logs, rollback })
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    /// The current head (`None` before `initialize`).
    pub async fn head(&self) -> Option<Block> {
        self.state.lock().await.cache.head().cloned()
    }

    pub async fn cached_len(&self) -> usize {
        self.state.lock().await.cache.len()
    }

    /// A block from the cache, or from the source when it is not cached.
    pub async fn get_block(&self, number: u64) -> Result<Block, TrackerError> {
        let state = self.state.lock().await;
        if let Some(block) = state.cache.get(number) {
            return Ok(block.clone());
        }
        self.source.get_block(number).await.map_err(|e| {
            debug!(number, error = %e, "Block lookup failed");
            TrackerError::BlockNotFound { number }
        })
    }

    /// A subscriber's watermarks, by filter identity.
    pub async fn watermarks(&self, id: &str) -> Option<Watermarks> {
        let state = self.state.lock().await;
        state
            .registry
            .get(&id.to_ascii_lowercase())
            .map(|r| r.watermarks.clone())
    }

    /// Identities still awaiting initialization, sorted.
    pub async fn pending_initialization(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.pending.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Registered identities, sorted.
    pub async fn subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.registry.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    async fn reset(&self, state: &mut TrackerState, block: Block) {
        let target = block.to_ref();
        state.delivered = block.number;
        state.pending_rollback = None;
        state.cache.reset(block);
        let ids: Vec<String> = state.registry.keys().cloned().collect();
        for id in &ids {
            state.mark_pending(id);
        }
        self.initialize_pending(state, &target).await;
    }

    async fn resync(&self, state: &mut TrackerState, block: Block) -> BlockOutcome {
        warn!(
            number = block.number,
            hash = %block.hash,
            window = state.cache.capacity(),
            "No common ancestor within the cache window; re-initializing"
        );
        self.reset(state, block.clone()).await;
        self.fire_hooks(state, &block, &[]);
        BlockOutcome {
            logs: vec![],
            rollback: Some(block),
        }
    }

    /// Leave the cache alone and re-queue the subscribers just seeded on `block`.
    async fn skip_stale(&self, state: &mut TrackerState, block: &Block, seeded: &[String]) {
        let head = state.cache.head().map(Block::to_ref);
        info!(
            number = block.number,
            hash = %block.hash,
            head = head.as_ref().map_or(0, |h| h.number),
            "Block is not ahead of the canonical cache; ignored"
        );
        for id in seeded {
            state.mark_pending(id);
        }
        if let Some(head) = head {
            self.initialize_pending(state, &head).await;
        }
    }

    /// Try to seed every pending subscriber at `target`. Returns the ids seeded.
    async fn initialize_pending(&self, state: &mut TrackerState, target: &BlockRef) -> Vec<String> {
        let mut seeded = Vec::new();
        if state.pending.is_empty() {
            return seeded;
        }
        let ids: Vec<String> = state.pending.iter().cloned().collect();
        for id in ids {
            let Some(reg) = state.registry.get(&id) else {
                state.pending.remove(&id);
                continue;
            };
            let subscriber = Arc::clone(&reg.subscriber);
            let seed = match subscriber.initialize(target).await {
                Ok(seed) => seed,
                Err(e) => {
                    warn!(error = %subscriber_failure(&id, e), "Subscriber initialization failed");
                    continue;
                }
            };

            let known = if seed.number == target.number {
                Some(target.hash.as_str())
            } else {
                state.cache.get(seed.number).map(|b| b.hash.as_str())
            };
            if known.is_some_and(|hash| hash != seed.hash) {
                warn!(
                    subscriber = %id,
                    number = seed.number,
                    hash = %seed.hash,
                    "Subscriber seeded on a non-canonical block; re-queued"
                );
                continue;
            }

            info!(subscriber = %id, number = seed.number, "Subscriber initialized");
            if let Some(reg) = state.registry.get_mut(&id) {
                reg.watermarks = Watermarks {
                    initialized_at: Some(seed),
                    last_seen_event_block: None,
                };
            }
            state.pending.remove(&id);
            seeded.push(id);
        }
        seeded
    }

    /// Find the common ancestor of the cache and `target`, then re-link the
    /// cache from it up to `target`.
    async fn reorg(&self, state: &mut TrackerState, target: &Block) -> Result<Reorg, TrackerError> {
        let Some(ancestor) = self.find_common_ancestor(&state.cache, target).await? else {
            return Ok(Reorg::Resync);
        };
        if ancestor.number >= target.number {
            return Ok(Reorg::Stale);
        }
        let depth = state
            .cache
            .head()
            .map_or(0, |h| h.number.saturating_sub(ancestor.number));
        warn!(ancestor = ancestor.number, hash = %ancestor.hash, depth, "Common ancestor found");

        let orphaned = |wm: &BlockRef| {
            wm.number > ancestor.number && !(wm.number == target.number && wm.hash == target.hash)
        };
        let subscribers_orphaned = state.registry.values().any(|r| {
            r.watermarks.initialized_at.as_ref().is_some_and(orphaned)
                || r.watermarks.last_seen_event_block.as_ref().is_some_and(orphaned)
        });
        if ancestor.number < state.delivered || subscribers_orphaned {
            let keep_previous = state
                .pending_rollback
                .as_ref()
                .is_some_and(|p| p.number <= ancestor.number);
            if !keep_previous {
                state.pending_rollback = Some(ancestor.clone());
            }
            state.delivered = state.delivered.min(ancestor.number);
        }

        self.repair_chain(&mut state.cache, &ancestor, target).await?;
        Ok(Reorg::Repaired { ancestor })
    }

    /// Scan the window from the head downward, retrying the whole scan on
    /// fetch failures.
    async fn find_common_ancestor(
        &self,
        cache: &BlockCache,
        target: &Block,
    ) -> Result<Option<Block>, TrackerError> {
        let policy = self.config.block_retry();
        let mut attempt = 0;
        loop {
            let error = match self.scan_for_ancestor(cache, target).await {
                Ok(found) => return Ok(found),
                Err(e) => e,
            };
            attempt += 1;
            match policy.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts(),
                        error = %error,
                        "Common ancestor search failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(TrackerError::FailedGetBlock { attempts: attempt }),
            }
        }
    }

    async fn scan_for_ancestor(
        &self,
        cache: &BlockCache,
        target: &Block,
    ) -> Result<Option<Block>, TrackerError> {
        // The initialization block alone has nothing below it to compare.
        if cache.len() <= 1 {
            return Ok(None);
        }
        for cached in cache.iter_rev() {
            let canonical = match self.source.get_block(cached.number).await {
                Ok(canonical) => canonical,
                // A shorter fork: the source has nothing above the new head yet.
                Err(e) if e.is_not_found() && cached.number > target.number => {
                    debug!(number = cached.number, "Cached block above the new fork's tip");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if canonical.hash == cached.hash {
                return Ok(Some(cached.clone()));
            }
            debug!(
                number = cached.number,
                cached = %cached.hash,
                canonical = %canonical.hash,
                "Cached block orphaned"
            );
        }
        Ok(None)
    }

    /// Rewind to `ancestor` and append the missing blocks plus `target`,
    /// checking parent linkage at every step. Retried from scratch while the
    /// chain keeps moving.
    async fn repair_chain(
        &self,
        cache: &mut BlockCache,
        ancestor: &Block,
        target: &Block,
    ) -> Result<(), TrackerError> {
        let policy = self.config.block_retry();
        let mut attempt = 0;
        loop {
            cache.rewind_to(ancestor.number);
            let failure = match self.relink(cache, target).await {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };
            attempt += 1;
            let error = match failure {
                RepairFailure::Fetch(e) => e,
                RepairFailure::Unlinked { number } => {
                    debug!(number, "Fetched block does not link to the cache head");
                    TrackerError::MaxRetryReach {
                        stage: RetryStage::ChainRepair,
                        attempts: attempt,
                    }
                }
            };
            match policy.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts(),
                        error = %error,
                        "Chain repair failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            }
        }
    }

    async fn relink(&self, cache: &mut BlockCache, target: &Block) -> Result<(), RepairFailure> {
        let from = cache.head().map_or(target.number, |h| h.number + 1);
        let fetched = try_join_all((from..target.number).map(|n| self.source.get_block(n)))
            .await
            .map_err(RepairFailure::Fetch)?;

        for block in fetched.into_iter().chain(std::iter::once(target.clone())) {
            let linked = cache.head().is_some_and(|head| block.extends(head));
            if !linked {
                return Err(RepairFailure::Unlinked {
                    number: block.number,
                });
            }
            cache.push(block);
        }
        Ok(())
    }

    /// Query logs over `(delivered, head]`, repairing the cache whenever a log
    /// reports a block hash the cache does not hold. Both transient failures
    /// and mid-fetch reorgs consume the log retry budget.
    async fn fetch_logs(&self, state: &mut TrackerState) -> Result<LogFetch, TrackerError> {
        let policy = self.config.logs_retry();
        let filters = state.filters();
        let mut attempt = 0;
        loop {
            let Some(head) = state.cache.head().cloned() else {
                return Err(TrackerError::NotInitialized);
            };
            let from = state.delivered.min(head.number);

            let error = match self.source.get_logs(from, head.number, &filters).await {
                Err(e) => e,
                Ok(logs) => {
                    let orphaned = logs.iter().position(|l| {
                        state.cache.get(l.block_number).is_some_and(|b| b.hash != l.block_hash)
                    });
                    let Some(i) = orphaned else {
                        return Ok(LogFetch::Logs(logs));
                    };
                    let orphan = &logs[i];
                    warn!(
                        number = orphan.block_number,
                        reported = %orphan.block_hash,
                        "Log from a block outside the cached chain; chain moved during fetch"
                    );
                    match self.source.get_block(head.number).await {
                        Err(e) => e,
                        Ok(canonical) => match self.reorg(state, &canonical).await? {
                            Reorg::Resync => return Ok(LogFetch::Resync(canonical)),
                            Reorg::Repaired { .. } | Reorg::Stale => TrackerError::Other(format!(
                                "chain moved while fetching logs up to block {}",
                                head.number
                            )),
                        },
                    }
                }
            };

            attempt += 1;
            match policy.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts(),
                        error = %error,
                        "Log fetch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(TrackerError::MaxRetryReach {
                        stage: RetryStage::GetLogs,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    /// Roll back every subscriber with a watermark above `ancestor`; logs in
    /// `(ancestor, head]` are delivered again. Subscribers seeded above the
    /// ancestor are also re-queued, unless the seed is still cached and they
    /// have applied nothing since.
    async fn rollback_subscribers(&self, state: &mut TrackerState, ancestor: &Block) {
        let target = ancestor.to_ref();
        let above = |wm: &Option<BlockRef>| wm.as_ref().is_some_and(|wm| wm.number > ancestor.number);
        let cache = &state.cache;

        let affected: Vec<(String, bool)> = state
            .registry
            .iter()
            .filter_map(|(id, r)| {
                let wm = &r.watermarks;
                let reseed = above(&wm.initialized_at);
                let seen_above = above(&wm.last_seen_event_block);
                let canonical_seed = wm
                    .initialized_at
                    .as_ref()
                    .is_some_and(|s| cache.get(s.number).is_some_and(|b| b.hash == s.hash));
                if reseed && canonical_seed && wm.last_seen_event_block.is_none() {
                    return None;
                }
                (reseed || seen_above).then(|| (id.clone(), reseed))
            })
            .collect();

        for (id, reseed) in affected {
            let Some(reg) = state.registry.get(&id) else {
                continue;
            };
            let subscriber = Arc::clone(&reg.subscriber);
            match subscriber.rollback(&target).await {
                Ok(()) if !reseed => {
                    info!(subscriber = %id, to = target.number, "Subscriber rolled back");
                    if let Some(reg) = state.registry.get_mut(&id) {
                        reg.watermarks.last_seen_event_block = Some(target.clone());
                    }
                }
                Ok(()) => {
                    info!(subscriber = %id, to = target.number, "Subscriber seeded after the fork; re-queued");
                    state.mark_pending(&id);
                }
                Err(e) => {
                    warn!(error = %subscriber_failure(&id, e), "Subscriber rollback failed; re-queued");
                    state.mark_pending(&id);
                }
            }
        }
    }

    /// Deliver logs in order to the subscribers whose filters match.
    async fn deliver(&self, state: &mut TrackerState, logs: &[Log]) {
        for log in logs {
            let targets: Vec<String> = state
                .registry
                .iter()
                .filter(|(_, r)| r.filter.matches(log) && r.watermarks.accepts(log.block_number))
                .map(|(id, _)| id.clone())
                .collect();

            for id in targets {
                let Some(reg) = state.registry.get(&id) else {
                    continue;
                };
                let subscriber = Arc::clone(&reg.subscriber);
                match subscriber.handle_log(log).await {
                    Ok(()) => {
                        if let Some(reg) = state.registry.get_mut(&id) {
                            reg.watermarks.last_seen_event_block = Some(log.block());
                        }
                    }
                    Err(e) => {
                        warn!(
                            number = log.block_number,
                            log_index = log.log_index,
                            error = %subscriber_failure(&id, e),
                            "Subscriber failed to handle log; re-queued"
                        );
                        state.mark_pending(&id);
                    }
                }
            }
        }
    }

    fn fire_hooks(&self, state: &TrackerState, block: &Block, logs: &[Log]) {
        if state.hooks.is_empty() {
            return;
        }
        let logs: Arc<[Log]> = logs.into();
        for hook in &state.hooks {
            let hook = Arc::clone(hook);
            let block = block.clone();
            let logs = Arc::clone(&logs);
            tokio::spawn(async move {
                if let Err(e) = hook.on_block(&block, &logs).await {
                    warn!(number = block.number, error = %e, "Block hook failed");
                }
            });
        }
    }
}

fn subscriber_failure(id: &str, error: TrackerError) -> TrackerError {
    TrackerError::Subscriber {
        id: id.to_string(),
        reason: error.to_string(),
    }
}
