//! Region list: the space allocator for the data segment.
//!
//! Every region slot is in-use, free, or empty. In-use regions hang off an
//! offset-keyed hash table. Free regions sit in two skip lists, one ordered
//! by offset for consolidation and one by `(extent, offset)` for best fit.
//! Empty slots form a plain singly linked list. A free region borrows its
//! `next` field for its by-offset node and `prev` for its by-extent node;
//! in-use regions reuse the same fields as hash-chain links.

use log::{debug, error};

use crate::index::fblk::{Fblk, LevelRng, MAX_LEVELS};
use crate::slab::{get_u64, put_u64};
use crate::{Error, Result};

pub(crate) const RL_MAGIC: u64 = 0x524c_4841;
const HASH_MAGIC: u64 = 0x524c_4842;
/// Null region link.
pub(crate) const REGION_NONE: u64 = u64::MAX;
/// Allocation flag kept in the low bit of `extent`.
const ISALLOC: u64 = 0x1;

const FOFF_HEAD: usize = 0;
const FOFF_TAIL: usize = 1;
const FEXT_HEAD: usize = 2;
const FEXT_TAIL: usize = 3;
/// Sentinel regions preceding the user slots.
pub(crate) const RESERVED_REGIONS: u64 = 4;

const MAGIC: usize = 0;
const NALLOC: usize = 8;
const NCHAINS: usize = 16;
const EMPTY: usize = 24;
const NELEMS: usize = 32;
const MAXELEMS: usize = 40;
const NFREE: usize = 48;
const MAXFREE: usize = 56;
const MAXFEXTENT: usize = 64;
const NEMPTY: usize = 72;
const MINEMPTY: usize = 80;
const NBYTES: usize = 88;
const MAXBYTES: usize = 96;
const LEVEL_FOFF: usize = 104;
const LEVEL_FEXT: usize = 112;
const HEADER_LEN: usize = 120;

const REGION_LEN: usize = 32;
const R_OFFSET: usize = 0;
const R_EXTENT: usize = 8;
const R_NEXT: usize = 16;
const R_PREV: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    ByOffset,
    ByExtent,
}

impl List {
    fn head(self) -> usize {
        match self {
            List::ByOffset => FOFF_HEAD,
            List::ByExtent => FEXT_HEAD,
        }
    }

    fn tail(self) -> usize {
        match self {
            List::ByOffset => FOFF_TAIL,
            List::ByExtent => FEXT_TAIL,
        }
    }

    fn node_field(self) -> usize {
        match self {
            List::ByOffset => R_NEXT,
            List::ByExtent => R_PREV,
        }
    }

    fn level_field(self) -> usize {
        match self {
            List::ByOffset => LEVEL_FOFF,
            List::ByExtent => LEVEL_FEXT,
        }
    }
}

/// Snapshot of the allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionCounters {
    pub in_use: u64,
    pub free: u64,
    pub empty: u64,
    pub max_in_use: u64,
    pub max_free: u64,
    pub min_empty: u64,
    pub bytes: u64,
    pub max_bytes: u64,
    pub max_free_extent: u64,
}

pub(crate) struct RegionList<B> {
    buf: B,
}

pub(crate) fn byte_len(slots: u64, nchains: u64) -> usize {
    HEADER_LEN + (slots + RESERVED_REGIONS) as usize * REGION_LEN + 8 + nchains as usize * 8
}

impl<B: AsRef<[u8]>> RegionList<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn word(&self, at: usize) -> u64 {
        get_u64(self.buf.as_ref(), at)
    }

    fn field(&self, ix: usize, field: usize) -> u64 {
        self.word(HEADER_LEN + ix * REGION_LEN + field)
    }

    fn chains_at(&self) -> usize {
        HEADER_LEN + self.word(NALLOC) as usize * REGION_LEN
    }

    fn chain(&self, bucket: usize) -> u64 {
        self.word(self.chains_at() + 8 + bucket * 8)
    }

    pub fn magic(&self) -> u64 {
        self.word(MAGIC)
    }

    /// Usable region slots, sentinels excluded.
    pub fn slots(&self) -> u64 {
        self.word(NALLOC).saturating_sub(RESERVED_REGIONS)
    }

    pub fn nchains(&self) -> u64 {
        self.word(NCHAINS)
    }

    pub fn in_use(&self) -> u64 {
        self.word(NELEMS)
    }

    #[cfg(test)]
    pub fn max_free_extent(&self) -> u64 {
        self.word(MAXFEXTENT)
    }

    pub fn counters(&self) -> RegionCounters {
        RegionCounters {
            in_use: self.word(NELEMS),
            free: self.word(NFREE),
            empty: self.word(NEMPTY),
            max_in_use: self.word(MAXELEMS),
            max_free: self.word(MAXFREE),
            min_empty: self.word(MINEMPTY),
            bytes: self.word(NBYTES),
            max_bytes: self.word(MAXBYTES),
            max_free_extent: self.word(MAXFEXTENT),
        }
    }

    pub fn is_valid(&self, slots: u64, nchains: u64) -> bool {
        self.magic() == RL_MAGIC
            && self.word(NALLOC) == slots + RESERVED_REGIONS
            && self.nchains() == nchains
            && self.word(self.chains_at()) == HASH_MAGIC
    }

    pub fn offset(&self, ix: usize) -> u64 {
        self.field(ix, R_OFFSET)
    }

    /// Extent with the allocation flag masked off.
    pub fn extent(&self, ix: usize) -> u64 {
        self.field(ix, R_EXTENT) & !ISALLOC
    }

    pub fn is_allocated(&self, ix: usize) -> bool {
        self.field(ix, R_EXTENT) & ISALLOC != 0
    }

    fn bucket(&self, offset: u64) -> usize {
        ((offset as u32) % self.nchains() as u32) as usize
    }

    /// In-use region starting at `offset`.
    pub fn find(&self, offset: u64) -> Option<usize> {
        let mut ix = self.chain(self.bucket(offset));
        while ix != REGION_NONE {
            if self.offset(ix as usize) == offset {
                return Some(ix as usize);
            }
            ix = self.field(ix as usize, R_NEXT);
        }
        None
    }

    fn level(&self, list: List) -> usize {
        self.word(list.level_field()) as usize
    }

    fn node(&self, list: List, ix: usize) -> u32 {
        self.field(ix, list.node_field()) as u32
    }

    fn key(&self, list: List, ix: usize) -> (u64, u64) {
        match list {
            List::ByOffset => (self.offset(ix), 0),
            List::ByExtent => (self.extent(ix), self.offset(ix)),
        }
    }

    fn forward<F: AsRef<[u8]>>(&self, fb: &Fblk<F>, list: List, ix: usize, k: usize) -> usize {
        fb.link(self.node(list, ix), k) as usize
    }

    /// Rightmost node strictly below `key` at every level.
    fn predecessors<F: AsRef<[u8]>>(
        &self,
        fb: &Fblk<F>,
        list: List,
        key: (u64, u64),
    ) -> [usize; MAX_LEVELS] {
        let mut update = [list.head(); MAX_LEVELS];
        let mut p = list.head();
        for k in (0..=self.level(list)).rev() {
            loop {
                let q = self.forward(fb, list, p, k);
                if q != list.tail() && self.key(list, q) < key {
                    p = q;
                } else {
                    break;
                }
            }
            update[k] = p;
        }
        update
    }

    /// Free region immediately after `ix` in offset order.
    fn offset_next<F: AsRef<[u8]>>(&self, fb: &Fblk<F>, ix: usize) -> Option<usize> {
        let next = self.forward(fb, List::ByOffset, ix, 0);
        (next != FOFF_TAIL).then_some(next)
    }

    /// Free region immediately before `ix` in offset order.
    fn offset_prev<F: AsRef<[u8]>>(&self, fb: &Fblk<F>, ix: usize) -> Option<usize> {
        let prev = self.predecessors(fb, List::ByOffset, self.key(List::ByOffset, ix))[0];
        (prev != FOFF_HEAD).then_some(prev)
    }

    /// Largest free extent, 0 when nothing is free.
    fn largest_free<F: AsRef<[u8]>>(&self, fb: &Fblk<F>) -> u64 {
        let last = self.predecessors(fb, List::ByExtent, (u64::MAX, u64::MAX))[0];
        if last == FEXT_HEAD {
            0
        } else {
            self.extent(last)
        }
    }

    /// Smallest free region with extent of at least `extent`.
    fn best_fit<F: AsRef<[u8]>>(&self, fb: &Fblk<F>, extent: u64) -> Option<usize> {
        let update = self.predecessors(fb, List::ByExtent, (extent, 0));
        let q = self.forward(fb, List::ByExtent, update[0], 0);
        (q != FEXT_TAIL).then_some(q)
    }

    /// Free extents in ascending order.
    pub fn free_extents<F: AsRef<[u8]>>(&self, fb: &Fblk<F>) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut ix = self.forward(fb, List::ByExtent, FEXT_HEAD, 0);
        while ix != FEXT_TAIL {
            out.push((self.offset(ix), self.extent(ix)));
            ix = self.forward(fb, List::ByExtent, ix, 0);
        }
        out
    }

    /// Free regions in offset order.
    #[cfg(test)]
    pub fn free_regions<F: AsRef<[u8]>>(&self, fb: &Fblk<F>) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut ix = self.forward(fb, List::ByOffset, FOFF_HEAD, 0);
        while ix != FOFF_TAIL {
            out.push((self.offset(ix), self.extent(ix)));
            ix = self.forward(fb, List::ByOffset, ix, 0);
        }
        out
    }
}

impl RegionList<&mut [u8]> {
    fn set_word(&mut self, at: usize, value: u64) {
        put_u64(self.buf, at, value);
    }

    fn set_field(&mut self, ix: usize, field: usize, value: u64) {
        self.set_word(HEADER_LEN + ix * REGION_LEN + field, value);
    }

    fn set_chain(&mut self, bucket: usize, value: u64) {
        let at = self.chains_at() + 8 + bucket * 8;
        self.set_word(at, value);
    }

    fn bump(&mut self, at: usize, delta: i64) {
        let value = self.word(at).wrapping_add_signed(delta);
        self.set_word(at, value);
    }

    fn raise(&mut self, at: usize, value: u64) {
        if value > self.word(at) {
            self.set_word(at, value);
        }
    }

    pub fn init(&mut self, fb: &mut Fblk<&mut [u8]>, slots: u64, nchains: u64) -> Result<()> {
        let nalloc = slots + RESERVED_REGIONS;
        let len = byte_len(slots, nchains);
        self.buf[..len].fill(0);
        self.set_word(NALLOC, nalloc);
        self.set_word(NCHAINS, nchains);
        let top = fb.max_size() - 1;

        for (head, tail, list) in [
            (FOFF_HEAD, FOFF_TAIL, List::ByOffset),
            (FEXT_HEAD, FEXT_TAIL, List::ByExtent),
        ] {
            let head_node = fb
                .get(top)
                .ok_or(Error::NoSpace("skip-list node arena exhausted"))?;
            for k in 0..=top {
                fb.set_link(head_node, k, tail as u32);
            }
            let tail_node = fb
                .get(0)
                .ok_or(Error::NoSpace("skip-list node arena exhausted"))?;
            fb.set_link(tail_node, 0, tail as u32);
            self.set_field(head, list.node_field(), head_node as u64);
            self.set_field(tail, list.node_field(), tail_node as u64);
        }
        // The other link field of each sentinel is unused.
        self.set_field(FOFF_HEAD, R_PREV, REGION_NONE);
        self.set_field(FOFF_TAIL, R_PREV, REGION_NONE);
        self.set_field(FEXT_HEAD, R_NEXT, REGION_NONE);
        self.set_field(FEXT_TAIL, R_NEXT, REGION_NONE);
        self.set_field(FOFF_TAIL, R_OFFSET, i64::MAX as u64);
        self.set_field(FEXT_TAIL, R_OFFSET, i64::MAX as u64);
        self.set_field(FEXT_TAIL, R_EXTENT, u64::MAX & !ISALLOC);

        for ix in RESERVED_REGIONS as usize..nalloc as usize {
            let next = if ix + 1 < nalloc as usize {
                ix as u64 + 1
            } else {
                REGION_NONE
            };
            self.set_field(ix, R_OFFSET, REGION_NONE);
            self.set_field(ix, R_NEXT, next);
            self.set_field(ix, R_PREV, REGION_NONE);
        }
        self.set_word(EMPTY, RESERVED_REGIONS);
        self.set_word(NEMPTY, slots);
        self.set_word(MINEMPTY, slots);
        self.set_word(LEVEL_FOFF, 0);
        self.set_word(LEVEL_FEXT, 0);

        let chains = self.chains_at();
        self.set_word(chains, HASH_MAGIC);
        for bucket in 0..nchains as usize {
            self.set_chain(bucket, REGION_NONE);
        }
        self.set_word(MAGIC, RL_MAGIC);
        Ok(())
    }

    fn take_empty(&mut self) -> Option<usize> {
        let ix = self.word(EMPTY);
        if ix == REGION_NONE {
            return None;
        }
        let next = self.field(ix as usize, R_NEXT);
        self.set_word(EMPTY, next);
        self.bump(NEMPTY, -1);
        let empty = self.word(NEMPTY);
        if empty < self.word(MINEMPTY) {
            self.set_word(MINEMPTY, empty);
        }
        Some(ix as usize)
    }

    fn give_empty(&mut self, ix: usize) {
        self.set_field(ix, R_OFFSET, REGION_NONE);
        self.set_field(ix, R_EXTENT, 0);
        self.set_field(ix, R_PREV, REGION_NONE);
        let head = self.word(EMPTY);
        self.set_field(ix, R_NEXT, head);
        self.set_word(EMPTY, ix as u64);
        self.bump(NEMPTY, 1);
    }

    fn hash_add(&mut self, ix: usize) {
        let bucket = self.bucket(self.offset(ix));
        let head = self.chain(bucket);
        self.set_field(ix, R_NEXT, head);
        self.set_field(ix, R_PREV, REGION_NONE);
        if head != REGION_NONE {
            self.set_field(head as usize, R_PREV, ix as u64);
        }
        self.set_chain(bucket, ix as u64);
    }

    fn hash_del(&mut self, ix: usize) {
        let next = self.field(ix, R_NEXT);
        let prev = self.field(ix, R_PREV);
        if prev == REGION_NONE {
            let bucket = self.bucket(self.offset(ix));
            self.set_chain(bucket, next);
        } else {
            self.set_field(prev as usize, R_NEXT, next);
        }
        if next != REGION_NONE {
            self.set_field(next as usize, R_PREV, prev);
        }
    }

    fn link(
        &mut self,
        fb: &mut Fblk<&mut [u8]>,
        rng: &mut LevelRng,
        list: List,
        ix: usize,
    ) -> Result<()> {
        let mut update = self.predecessors(fb, list, self.key(list, ix));
        let level = self.level(list);
        let mut height = rng.level(fb.max_size() - 1);
        if height > level {
            height = level + 1;
            update[height] = list.head();
        }
        let node = fb
            .get(height)
            .ok_or(Error::NoSpace("skip-list node arena exhausted"))?;
        self.set_field(ix, list.node_field(), node as u64);
        for (k, &pred) in update.iter().enumerate().take(height + 1) {
            let pred_node = self.node(list, pred);
            fb.set_link(node, k, fb.link(pred_node, k));
            fb.set_link(pred_node, k, ix as u32);
        }
        if height > level {
            self.set_word(list.level_field(), height as u64);
        }
        Ok(())
    }

    fn unlink(&mut self, fb: &mut Fblk<&mut [u8]>, list: List, ix: usize) -> Result<()> {
        let update = self.predecessors(fb, list, self.key(list, ix));
        if self.forward(fb, list, update[0], 0) != ix {
            error!(
                "free region {ix} at offset {} missing from {list:?} list",
                self.offset(ix)
            );
            return Err(Error::Corrupt("free region missing from skip list"));
        }
        let mut level = self.level(list);
        let node = self.node(list, ix);
        let mut height = 0;
        while height <= level && self.forward(fb, list, update[height], height) == ix {
            let pred_node = self.node(list, update[height]);
            fb.set_link(pred_node, height, fb.link(node, height));
            height += 1;
        }
        fb.release(height - 1, node);
        while level > 0 && self.forward(fb, list, list.head(), level) == list.tail() {
            level -= 1;
        }
        self.set_word(list.level_field(), level as u64);
        Ok(())
    }

    /// Puts a detached region on both free lists.
    fn release(&mut self, fb: &mut Fblk<&mut [u8]>, rng: &mut LevelRng, ix: usize) -> Result<()> {
        self.link(fb, rng, List::ByOffset, ix)?;
        self.link(fb, rng, List::ByExtent, ix)?;
        self.bump(NFREE, 1);
        let free = self.word(NFREE);
        self.raise(MAXFREE, free);
        Ok(())
    }

    /// Creates a free region from an empty slot.
    pub fn add(
        &mut self,
        fb: &mut Fblk<&mut [u8]>,
        rng: &mut LevelRng,
        offset: u64,
        extent: u64,
    ) -> Result<usize> {
        let Some(ix) = self.take_empty() else {
            error!(
                "Need more product slots: {} in use, {} free",
                self.word(NELEMS),
                self.word(NFREE)
            );
            return Err(Error::NoSpace("region slots exhausted"));
        };
        self.set_field(ix, R_OFFSET, offset);
        self.set_field(ix, R_EXTENT, extent);
        self.release(fb, rng, ix)?;
        self.raise(MAXFEXTENT, extent);
        Ok(ix)
    }

    /// Best-fit allocation. The region leaves the free lists but is not yet
    /// marked allocated.
    pub fn get(&mut self, fb: &mut Fblk<&mut [u8]>, extent: u64) -> Result<Option<usize>> {
        if extent > self.word(MAXFEXTENT) {
            return Ok(None);
        }
        let Some(ix) = self.best_fit(fb, extent) else {
            return Ok(None);
        };
        self.unlink(fb, List::ByOffset, ix)?;
        self.unlink(fb, List::ByExtent, ix)?;
        self.bump(NFREE, -1);
        if self.extent(ix) == self.word(MAXFEXTENT) {
            let largest = self.largest_free(fb);
            self.set_word(MAXFEXTENT, largest);
        }
        self.bump(NELEMS, 1);
        let in_use = self.word(NELEMS);
        self.raise(MAXELEMS, in_use);
        Ok(Some(ix))
    }

    /// Shrinks `ix` to `extent`, freeing the tail as a new region.
    pub fn split(
        &mut self,
        fb: &mut Fblk<&mut [u8]>,
        rng: &mut LevelRng,
        ix: usize,
        extent: u64,
    ) -> Result<()> {
        let remainder = self.extent(ix) - extent;
        let offset = self.offset(ix) + extent;
        self.add(fb, rng, offset, remainder)?;
        self.set_field(ix, R_EXTENT, extent);
        Ok(())
    }

    /// Marks a region allocated and indexes it by offset.
    pub fn mark(&mut self, ix: usize) {
        let extent = self.extent(ix);
        self.set_field(ix, R_EXTENT, extent | ISALLOC);
        self.hash_add(ix);
        self.bump(NBYTES, extent as i64);
        let bytes = self.word(NBYTES);
        self.raise(MAXBYTES, bytes);
    }

    pub fn unmark(&mut self, ix: usize) {
        let extent = self.extent(ix);
        self.hash_del(ix);
        self.set_field(ix, R_EXTENT, extent);
        self.bump(NBYTES, -(extent as i64));
    }

    /// Returns an unmarked region obtained from `get` to the free lists.
    pub fn put(&mut self, fb: &mut Fblk<&mut [u8]>, rng: &mut LevelRng, ix: usize) -> Result<()> {
        self.bump(NELEMS, -1);
        self.release(fb, rng, ix)?;
        self.consolidate(fb, rng, ix)
    }

    /// Frees an in-use region.
    pub fn free(&mut self, fb: &mut Fblk<&mut [u8]>, rng: &mut LevelRng, ix: usize) -> Result<()> {
        if !self.is_allocated(ix) {
            return Err(Error::Invalid("region is not in use"));
        }
        self.unmark(ix);
        self.put(fb, rng, ix)
    }

    /// Merges `ix` with offset-adjacent free neighbours.
    fn consolidate(
        &mut self,
        fb: &mut Fblk<&mut [u8]>,
        rng: &mut LevelRng,
        ix: usize,
    ) -> Result<()> {
        let mut rep = ix;
        if let Some(right) = self.offset_next(fb, ix) {
            if self.offset(ix) + self.extent(ix) == self.offset(right) {
                let grown = self.extent(ix) + self.extent(right);
                self.unlink(fb, List::ByOffset, right)?;
                self.unlink(fb, List::ByExtent, right)?;
                self.give_empty(right);
                self.bump(NFREE, -1);
                self.unlink(fb, List::ByExtent, ix)?;
                self.set_field(ix, R_EXTENT, grown);
                self.link(fb, rng, List::ByExtent, ix)?;
                debug!("merged region at {} into {}", self.offset(ix), grown);
            }
        }
        if let Some(left) = self.offset_prev(fb, ix) {
            if self.offset(left) + self.extent(left) == self.offset(ix) {
                let grown = self.extent(left) + self.extent(ix);
                self.unlink(fb, List::ByOffset, ix)?;
                self.unlink(fb, List::ByExtent, ix)?;
                self.give_empty(ix);
                self.bump(NFREE, -1);
                self.unlink(fb, List::ByExtent, left)?;
                self.set_field(left, R_EXTENT, grown);
                self.link(fb, rng, List::ByExtent, left)?;
                rep = left;
            }
        }
        let extent = self.extent(rep);
        self.raise(MAXFEXTENT, extent);
        Ok(())
    }
}
