//! Time index: in-use products ordered by insertion time.
//!
//! Element 0 is NIL (time = end of time) and terminates every level.
//! Element 1 is HEAD with a full-height node. Keys are unique: a colliding
//! insertion time is bumped by one microsecond until it is free.

use log::error;

use crate::index::fblk::{Fblk, LevelRng, MAX_LEVELS};
use crate::slab::{get_i64, get_u64, put_i64, put_u64};
use crate::timestamp::{Direction, Timestamp};
use crate::{Error, Result};

pub(crate) const TQ_MAGIC: u64 = 0x5451_5545;
const NIL: usize = 0;
const HEAD: usize = 1;
const RESERVED: u64 = 2;
const FREE_NONE: u64 = u64::MAX;

const MAGIC: usize = 0;
const NALLOC: usize = 8;
const NELEMS: usize = 16;
const LEVEL: usize = 24;
const FREE: usize = 32;
const HEADER_LEN: usize = 40;

const ELEM_LEN: usize = 32;
const E_SEC: usize = 0;
const E_USEC: usize = 8;
/// Region offset while live, free-list link otherwise.
const E_OFFSET: usize = 16;
const E_NODE: usize = 24;

/// Copy of one live time-index element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeEntry {
    pub(crate) index: usize,
    pub time: Timestamp,
    pub offset: u64,
}

pub(crate) fn byte_len(slots: u64) -> usize {
    HEADER_LEN + (slots + RESERVED) as usize * ELEM_LEN
}

pub(crate) struct TimeQueue<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> TimeQueue<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn word(&self, at: usize) -> u64 {
        get_u64(self.buf.as_ref(), at)
    }

    fn elem_at(ix: usize) -> usize {
        HEADER_LEN + ix * ELEM_LEN
    }

    pub fn magic(&self) -> u64 {
        self.word(MAGIC)
    }

    pub fn slots(&self) -> u64 {
        self.word(NALLOC).saturating_sub(RESERVED)
    }

    /// Live products.
    pub fn len(&self) -> u64 {
        self.word(NELEMS).saturating_sub(RESERVED)
    }

    pub fn is_valid(&self, slots: u64) -> bool {
        self.magic() == TQ_MAGIC && self.word(NALLOC) == slots + RESERVED
    }

    fn level(&self) -> usize {
        self.word(LEVEL) as usize
    }

    fn time(&self, ix: usize) -> Timestamp {
        let at = Self::elem_at(ix);
        Timestamp::new(
            get_i64(self.buf.as_ref(), at + E_SEC),
            get_i64(self.buf.as_ref(), at + E_USEC),
        )
    }

    fn offset(&self, ix: usize) -> u64 {
        self.word(Self::elem_at(ix) + E_OFFSET)
    }

    fn node(&self, ix: usize) -> u32 {
        self.word(Self::elem_at(ix) + E_NODE) as u32
    }

    fn forward<F: AsRef<[u8]>>(&self, fb: &Fblk<F>, ix: usize, k: usize) -> usize {
        fb.link(self.node(ix), k) as usize
    }

    fn entry(&self, ix: usize) -> Option<TimeEntry> {
        (ix != NIL && ix != HEAD).then(|| TimeEntry {
            index: ix,
            time: self.time(ix),
            offset: self.offset(ix),
        })
    }

    fn precedes(&self, ix: usize, key: (Timestamp, u64)) -> bool {
        ix != NIL && (self.time(ix), self.offset(ix)) < key
    }

    fn predecessors<F: AsRef<[u8]>>(
        &self,
        fb: &Fblk<F>,
        key: (Timestamp, u64),
    ) -> [usize; MAX_LEVELS] {
        let mut update = [HEAD; MAX_LEVELS];
        let mut p = HEAD;
        for k in (0..=self.level()).rev() {
            loop {
                let q = self.forward(fb, p, k);
                if self.precedes(q, key) {
                    p = q;
                } else {
                    break;
                }
            }
            update[k] = p;
        }
        update
    }

    /// Entry relative to `key`: greatest below, equal, or least above.
    pub fn find<F: AsRef<[u8]>>(
        &self,
        fb: &Fblk<F>,
        key: Timestamp,
        direction: Direction,
    ) -> Option<TimeEntry> {
        let p = self.predecessors(fb, (key, 0))[0];
        let mut q = self.forward(fb, p, 0);
        match direction {
            Direction::Backward => self.entry(p),
            Direction::Exact => {
                if q != NIL && self.time(q) == key {
                    self.entry(q)
                } else {
                    None
                }
            }
            Direction::Forward => {
                if q != NIL && self.time(q) == key {
                    q = self.forward(fb, q, 0);
                }
                self.entry(q)
            }
        }
    }

    /// Oldest entry.
    pub fn first<F: AsRef<[u8]>>(&self, fb: &Fblk<F>) -> Option<TimeEntry> {
        self.entry(self.forward(fb, HEAD, 0))
    }

    pub fn next<F: AsRef<[u8]>>(&self, fb: &Fblk<F>, entry: &TimeEntry) -> Option<TimeEntry> {
        self.entry(self.forward(fb, entry.index, 0))
    }
}

impl TimeQueue<&mut [u8]> {
    fn set_word(&mut self, at: usize, value: u64) {
        put_u64(self.buf, at, value);
    }

    fn set_time(&mut self, ix: usize, time: Timestamp) {
        let at = Self::elem_at(ix);
        put_i64(self.buf, at + E_SEC, time.sec);
        put_i64(self.buf, at + E_USEC, time.usec);
    }

    fn set_offset(&mut self, ix: usize, offset: u64) {
        self.set_word(Self::elem_at(ix) + E_OFFSET, offset);
    }

    fn set_node(&mut self, ix: usize, node: u32) {
        self.set_word(Self::elem_at(ix) + E_NODE, node as u64);
    }

    pub fn init(&mut self, fb: &mut Fblk<&mut [u8]>, slots: u64) -> Result<()> {
        let nalloc = slots + RESERVED;
        self.buf[..byte_len(slots)].fill(0);
        self.set_word(NALLOC, nalloc);

        let nil_node = fb
            .get(0)
            .ok_or(Error::NoSpace("skip-list node arena exhausted"))?;
        fb.set_link(nil_node, 0, NIL as u32);
        self.set_time(NIL, Timestamp::ENDT);
        self.set_offset(NIL, u64::MAX);
        self.set_node(NIL, nil_node);

        let top = fb.max_size() - 1;
        let head_node = fb
            .get(top)
            .ok_or(Error::NoSpace("skip-list node arena exhausted"))?;
        for k in 0..=top {
            fb.set_link(head_node, k, NIL as u32);
        }
        self.set_time(HEAD, Timestamp::ZERO);
        self.set_offset(HEAD, u64::MAX);
        self.set_node(HEAD, head_node);

        for ix in RESERVED as usize..nalloc as usize {
            let next = if ix + 1 < nalloc as usize {
                ix as u64 + 1
            } else {
                FREE_NONE
            };
            self.set_time(ix, Timestamp::NONE);
            self.set_offset(ix, next);
            self.set_node(ix, u32::MAX);
        }
        self.set_word(FREE, if slots > 0 { RESERVED } else { FREE_NONE });
        self.set_word(NELEMS, RESERVED);
        self.set_word(LEVEL, 0);
        self.set_word(MAGIC, TQ_MAGIC);
        Ok(())
    }

    fn take_free(&mut self) -> Option<usize> {
        let ix = self.word(FREE);
        if ix == FREE_NONE {
            return None;
        }
        let next = self.offset(ix as usize);
        self.set_word(FREE, next);
        Some(ix as usize)
    }

    fn give_free(&mut self, ix: usize) {
        let head = self.word(FREE);
        self.set_time(ix, Timestamp::NONE);
        self.set_offset(ix, head);
        self.set_node(ix, u32::MAX);
        self.set_word(FREE, ix as u64);
    }

    /// Inserts `offset` at time `now`, bumped past any colliding key.
    /// Returns the key actually stored.
    pub fn add(
        &mut self,
        fb: &mut Fblk<&mut [u8]>,
        rng: &mut LevelRng,
        offset: u64,
        now: Timestamp,
    ) -> Result<Timestamp> {
        let Some(ix) = self.take_free() else {
            error!("time index full: {} entries", self.len());
            return Err(Error::NoSpace("time-index slots exhausted"));
        };
        let level = self.level();
        let mut key = now;
        let mut update = [HEAD; MAX_LEVELS];
        let mut p = HEAD;
        let mut k = level as isize;
        while k >= 0 {
            let lvl = k as usize;
            loop {
                let q = self.forward(fb, p, lvl);
                if q != NIL && self.time(q) < key {
                    p = q;
                } else {
                    break;
                }
            }
            let q = self.forward(fb, p, lvl);
            if q != NIL && self.time(q) == key {
                key = key.incr();
                if lvl < level {
                    k = level as isize;
                    p = update[level];
                }
                continue;
            }
            update[lvl] = p;
            k -= 1;
        }

        let mut height = rng.level(fb.max_size() - 1);
        if height > level {
            height = level + 1;
            update[height] = HEAD;
        }
        let Some(node) = fb.get(height) else {
            self.give_free(ix);
            return Err(Error::NoSpace("skip-list node arena exhausted"));
        };
        self.set_time(ix, key);
        self.set_offset(ix, offset);
        self.set_node(ix, node);
        for (k, &pred) in update.iter().enumerate().take(height + 1) {
            let pred_node = self.node(pred);
            fb.set_link(node, k, fb.link(pred_node, k));
            fb.set_link(pred_node, k, ix as u32);
        }
        if height > level {
            self.set_word(LEVEL, height as u64);
        }
        let count = self.word(NELEMS);
        self.set_word(NELEMS, count + 1);
        Ok(key)
    }

    pub fn delete(&mut self, fb: &mut Fblk<&mut [u8]>, entry: &TimeEntry) -> Result<()> {
        let ix = entry.index;
        let update = self.predecessors(fb, (entry.time, entry.offset));
        if self.forward(fb, update[0], 0) != ix || self.offset(ix) != entry.offset {
            error!(
                "time entry {} at offset {} missing from time index",
                entry.time, entry.offset
            );
            return Err(Error::Corrupt("time entry missing from time index"));
        }
        let mut level = self.level();
        let node = self.node(ix);
        let mut height = 0;
        while height <= level && self.forward(fb, update[height], height) == ix {
            let pred_node = self.node(update[height]);
            fb.set_link(pred_node, height, fb.link(node, height));
            height += 1;
        }
        fb.release(height - 1, node);
        while level > 0 && self.forward(fb, HEAD, level) == NIL {
            level -= 1;
        }
        self.set_word(LEVEL, level as u64);
        self.give_free(ix);
        let count = self.word(NELEMS);
        self.set_word(NELEMS, count - 1);
        Ok(())
    }
}
