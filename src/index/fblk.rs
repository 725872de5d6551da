//! Free-block arena: the node storage shared by every skip list in the
//! index segment.
//!
//! A block of level `l` holds `l + 1` forward links. Blocks are handed out
//! from per-level free lists sized after the geometric height distribution,
//! plus a reserve pool of full-height blocks. Links are `u32` indices into
//! the arena so the structure is address independent.

use log::error;

use crate::slab::{get_u32, get_u64, put_u32, put_u64};

pub(crate) const FBLK_MAGIC: u64 = 0x5451_4642;
/// Upper bound on skip-list height.
pub(crate) const MAX_LEVELS: usize = 15;
/// Null block and null link.
pub(crate) const BLOCK_NONE: u32 = u32::MAX;

const MAGIC: usize = 0;
const MAXSIZE: usize = 8;
const ARENA_LEN: usize = 16;
const AVAIL: usize = 24;
const ALLOCATED: usize = 32;
const NFREE: usize = 40;
const FREE: usize = NFREE + (MAX_LEVELS + 1) * 8;
const HEADER_LEN: usize = FREE + (MAX_LEVELS + 1) * 8;

/// How an arena for `n` elements is partitioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FblkPlan {
    pub maxsize: usize,
    /// Blocks preallocated per level; level `l` blocks hold `l + 1` links.
    pub per_level: Vec<u64>,
    /// Reserve pool of `maxsize`-link blocks.
    pub pool: u64,
    pub arena_len: u64,
}

fn log4(n: f64) -> f64 {
    n.ln() / 4f64.ln()
}

impl FblkPlan {
    pub fn new(n: u64) -> Self {
        let maxsize = ((log4(n as f64 + 0.5).floor() as usize) + 1).clamp(1, MAX_LEVELS);
        let mut per_level = Vec::with_capacity(maxsize);
        let mut numblks = ((0.75 * n as f64) as u64).max(1);
        let mut entries = 0u64;
        let mut blocks = 0u64;
        for level in 0..maxsize {
            per_level.push(numblks);
            entries += numblks * (level as u64 + 1);
            blocks += numblks;
            numblks = if numblks >= 4 { numblks / 4 } else { 1 };
        }
        // Every list element needs at most one block: two per free region,
        // one per time entry, plus six sentinels.
        let variance = (3.0 * (n as f64).sqrt() * log4(n as f64).max(0.0)) as u64;
        let shortfall = (2 * n + 6).saturating_sub(blocks);
        let pool = variance.max(shortfall).max(1);
        entries += pool * maxsize as u64;
        Self {
            maxsize,
            per_level,
            pool,
            arena_len: entries,
        }
    }

    pub fn byte_len(&self) -> usize {
        HEADER_LEN + self.arena_len as usize * 4
    }
}

/// View over the arena bytes.
pub(crate) struct Fblk<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Fblk<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn word(&self, at: usize) -> u64 {
        get_u64(self.buf.as_ref(), at)
    }

    pub fn magic(&self) -> u64 {
        self.word(MAGIC)
    }

    /// Number of links in a full-height block.
    pub fn max_size(&self) -> usize {
        self.word(MAXSIZE) as usize
    }

    pub fn arena_len(&self) -> u64 {
        self.word(ARENA_LEN)
    }

    /// Link entries not currently handed out.
    pub fn avail(&self) -> u64 {
        self.word(AVAIL)
    }

    pub fn allocated(&self) -> u64 {
        self.word(ALLOCATED)
    }

    pub fn free_count(&self, level: usize) -> u64 {
        self.word(NFREE + level * 8)
    }

    fn free_head(&self, level: usize) -> u32 {
        self.word(FREE + level * 8) as u32
    }

    fn entry(&self, index: u32) -> u32 {
        get_u32(self.buf.as_ref(), HEADER_LEN + index as usize * 4)
    }

    /// Forward link `k` of `block`.
    #[inline]
    pub fn link(&self, block: u32, k: usize) -> u32 {
        self.entry(block + k as u32)
    }

    pub fn is_valid(&self, n: u64) -> bool {
        let plan = FblkPlan::new(n);
        self.magic() == FBLK_MAGIC
            && self.max_size() == plan.maxsize
            && self.arena_len() == plan.arena_len
    }
}

impl Fblk<&mut [u8]> {
    fn set_word(&mut self, at: usize, value: u64) {
        put_u64(self.buf, at, value);
    }

    fn set_entry(&mut self, index: u32, value: u32) {
        put_u32(self.buf, HEADER_LEN + index as usize * 4, value);
    }

    #[inline]
    pub fn set_link(&mut self, block: u32, k: usize, value: u32) {
        self.set_entry(block + k as u32, value);
    }

    fn set_free_head(&mut self, level: usize, block: u32) {
        self.set_word(FREE + level * 8, block as u64);
    }

    pub fn init(&mut self, n: u64) {
        let plan = FblkPlan::new(n);
        self.buf[..plan.byte_len()].fill(0);
        self.set_word(MAXSIZE, plan.maxsize as u64);
        self.set_word(ARENA_LEN, plan.arena_len);
        for level in 0..=MAX_LEVELS {
            self.set_free_head(level, BLOCK_NONE);
            self.set_word(NFREE + level * 8, 0);
        }
        let mut next = 0u32;
        for (level, &count) in plan.per_level.iter().enumerate() {
            for _ in 0..count {
                self.push(level, next);
                next += level as u32 + 1;
            }
        }
        // The pool sits on the list one past the top level.
        for _ in 0..plan.pool {
            self.push(plan.maxsize, next);
            next += plan.maxsize as u32;
        }
        self.set_word(AVAIL, plan.arena_len);
        self.set_word(ALLOCATED, 0);
        self.set_word(MAGIC, FBLK_MAGIC);
    }

    fn push(&mut self, list: usize, block: u32) {
        let head = self.free_head(list);
        self.set_entry(block, head);
        self.set_free_head(list, block);
        let count = self.free_count(list);
        self.set_word(NFREE + list * 8, count + 1);
    }

    fn block_size(&self, list: usize) -> usize {
        list.min(self.max_size() - 1) + 1
    }

    /// Takes a block with `level + 1` links. A larger block is split and
    /// its remainder returned to the matching smaller list.
    pub fn get(&mut self, level: usize) -> Option<u32> {
        let maxsize = self.max_size();
        let want = level + 1;
        let Some(list) = (level..=maxsize).find(|&list| self.free_head(list) != BLOCK_NONE) else {
            error!(
                "skip-list node arena exhausted: level {level}, {} of {} entries free",
                self.avail(),
                self.arena_len()
            );
            return None;
        };
        let block = self.free_head(list);
        let next = self.entry(block);
        self.set_free_head(list, next);
        let count = self.free_count(list);
        self.set_word(NFREE + list * 8, count - 1);

        let got = self.block_size(list);
        if got > want {
            self.push(got - want - 1, block + want as u32);
        }
        let avail = self.avail();
        self.set_word(AVAIL, avail - want as u64);
        let allocated = self.allocated();
        self.set_word(ALLOCATED, allocated + 1);
        Some(block)
    }

    /// Returns a block of `level + 1` links.
    pub fn release(&mut self, level: usize, block: u32) {
        self.push(level, block);
        let avail = self.avail();
        self.set_word(AVAIL, avail + level as u64 + 1);
        let allocated = self.allocated();
        self.set_word(ALLOCATED, allocated.saturating_sub(1));
    }
}

/// Skip-list height generator: a 48-bit linear congruential sequence,
/// seeded per instance, consumed two bits per level.
#[derive(Debug, Clone)]
pub(crate) struct LevelRng {
    state: u64,
    bits: u32,
    left: u32,
}

impl LevelRng {
    const MULTIPLIER: u64 = 0x5_DEEC_E66D;
    const INCREMENT: u64 = 0xB;
    const MASK: u64 = (1 << 48) - 1;

    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: (seed ^ Self::MULTIPLIER) & Self::MASK,
            bits: 0,
            left: 0,
        }
    }

    pub fn seeded() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|since| since.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(nanos ^ std::process::id() as u64)
    }

    fn next31(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(Self::MULTIPLIER)
            .wrapping_add(Self::INCREMENT)
            & Self::MASK;
        (self.state >> 17) as u32
    }

    /// Draws a level in `0..=cap`: each further level has probability 1/4.
    pub fn level(&mut self, cap: usize) -> usize {
        let mut level = 0;
        while level < cap {
            if self.left == 0 {
                self.bits = self.next31();
                self.left = 15;
            }
            let draw = self.bits & 3;
            self.bits >>= 2;
            self.left -= 1;
            if draw != 0 {
                break;
            }
            level += 1;
        }
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(n: u64) -> Vec<u8> {
        let mut buf = vec![0u8; FblkPlan::new(n).byte_len()];
        Fblk::new(&mut buf[..]).init(n);
        buf
    }

    #[test]
    fn plan_follows_level_distribution() {
        let plan = FblkPlan::new(1000);
        assert_eq!(plan.maxsize, 5);
        assert_eq!(plan.per_level, vec![750, 187, 46, 11, 2]);
        let blocks: u64 = plan.per_level.iter().sum::<u64>() + plan.pool;
        assert!(blocks >= 2 * 1000 + 6);
    }

    #[test]
    fn tiny_arena_has_one_level() {
        let plan = FblkPlan::new(1);
        assert_eq!(plan.maxsize, 1);
        assert_eq!(plan.per_level, vec![1]);
        assert!(plan.per_level[0] + plan.pool >= 8);
    }

    #[test]
    fn get_splits_larger_block() {
        let mut buf = arena(16);
        let mut fb = Fblk::new(&mut buf[..]);
        let maxsize = fb.max_size();
        assert_eq!(maxsize, 3);
        let before = fb.avail();
        while fb.free_count(0) > 0 {
            fb.get(0).expect("level 0 block");
        }
        let level1 = fb.free_count(1);
        fb.get(0).expect("split block");
        assert_eq!(fb.free_count(1), level1 - 1);
        assert_eq!(fb.free_count(0), 1);
        assert!(fb.avail() < before);
    }

    #[test]
    fn release_then_get_reuses_block() {
        let mut buf = arena(64);
        let mut fb = Fblk::new(&mut buf[..]);
        let block = fb.get(2).expect("block");
        let avail = fb.avail();
        fb.release(2, block);
        assert_eq!(fb.avail(), avail + 3);
        assert_eq!(fb.get(2), Some(block));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut buf = arena(1);
        let mut fb = Fblk::new(&mut buf[..]);
        let mut taken = 0;
        while fb.get(0).is_some() {
            taken += 1;
            assert!(taken < 10_000);
        }
        assert!(taken >= 8);
        assert_eq!(fb.avail(), 0);
    }

    #[test]
    fn level_draws_are_geometric() {
        let mut rng = LevelRng::with_seed(42);
        let mut counts = [0usize; 4];
        for _ in 0..40_000 {
            counts[rng.level(3)] += 1;
        }
        assert!(counts[0] > 28_000 && counts[0] < 32_000, "{counts:?}");
        assert!(counts[1] > counts[2]);
        assert_eq!(LevelRng::with_seed(7).level(0), 0);
    }
}
