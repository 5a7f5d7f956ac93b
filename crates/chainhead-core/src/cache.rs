//! Block cache: a bounded, contiguous window of recent blocks ending at the
//! current head.

use std::collections::VecDeque;

use crate::types::Block;

/// Holds at most `capacity` blocks with consecutive numbers (oldest first).
///
/// Between tracker operations every entry except the oldest links to its
/// predecessor by parent hash.
#[derive(Debug)]
pub struct BlockCache {
    window: VecDeque<Block>,
    capacity: usize,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Drop everything and start over from `block`.
    pub fn reset(&mut self, block: Block) {
        self.window.clear();
        self.window.push_back(block);
    }

    /// Append a block directly after the head, evicting the oldest entry when full.
    ///
    /// Returns `false` (and leaves the cache untouched) if `block.number` does not
    /// follow the head.
    pub fn push(&mut self, block: Block) -> bool {
        if let Some(head) = self.window.back() {
            if block.number != head.number + 1 {
                return false;
            }
        }
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(block);
        true
    }

    /// The current head (most recently added block).
    pub fn head(&self) -> Option<&Block> {
        self.window.back()
    }

    /// The oldest block still cached.
    pub fn oldest(&self) -> Option<&Block> {
        self.window.front()
    }

    /// Returns a block by number if it's in the window.
    pub fn get(&self, number: u64) -> Option<&Block> {
        let oldest = self.window.front()?.number;
        let offset = usize::try_from(number.checked_sub(oldest)?).ok()?;
        self.window.get(offset)
    }

    /// Returns `true` if a block with the same number and hash is cached.
    pub fn contains(&self, block: &Block) -> bool {
        self.get(block.number).is_some_and(|b| b.hash == block.hash)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard every block after `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    /// Cached blocks from newest to oldest.
    pub fn iter_rev(&self) -> impl Iterator<Item = &Block> {
        self.window.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64) -> Block {
        let parent = if number == 0 { "0x0".to_string() } else { format!("0x{}", number - 1) };
        Block::new(number, format!("0x{number}"), parent)
    }

    #[test]
    fn push_normal_chain() {
        let mut cache = BlockCache::new(10);
        cache.reset(block(100));
        assert!(cache.push(block(101)));
        assert!(cache.push(block(102)));
        assert_eq!(cache.head().unwrap().number, 102);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(101).unwrap().hash, "0x101");
        assert!(cache.get(99).is_none());
        assert!(cache.get(103).is_none());
    }

    #[test]
    fn push_rejects_gap() {
        let mut cache = BlockCache::new(10);
        cache.reset(block(5));
        assert!(!cache.push(block(7)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn window_size_enforced_oldest_first() {
        let mut cache = BlockCache::new(5);
        cache.reset(block(0));
        for i in 1..10 {
            assert!(cache.push(block(i)));
        }
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.oldest().unwrap().number, 5);
        assert_eq!(cache.head().unwrap().number, 9);
    }

    #[test]
    fn rewind_and_contains() {
        let mut cache = BlockCache::new(20);
        cache.reset(block(100));
        for i in 101..=110 {
            cache.push(block(i));
        }
        cache.rewind_to(105);
        assert_eq!(cache.head().unwrap().number, 105);
        assert!(cache.contains(&block(104)));
        assert!(!cache.contains(&Block::new(104, "0xother", "0x103")));
        assert!(!cache.contains(&block(106)));
    }

    #[test]
    fn reset_replaces_window() {
        let mut cache = BlockCache::new(4);
        cache.reset(block(1));
        cache.push(block(2));
        cache.reset(block(50));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.oldest().unwrap().number, 50);
    }
}
