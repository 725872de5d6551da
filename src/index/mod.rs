//! The index segment: region list, time index, node arena and signature
//! index, laid out back to back and each aligned.

pub(crate) mod fblk;
pub(crate) mod regions;
pub(crate) mod sigs;
pub(crate) mod timeq;

use crate::layout::{prev_prime, round_up};
use crate::Result;

use fblk::{Fblk, FblkPlan, LevelRng};
use regions::RegionList;
use sigs::SigIndex;
use timeq::TimeQueue;

pub use regions::RegionCounters;
pub use timeq::TimeEntry;

/// Byte offsets of each structure within the index segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLayout {
    pub slots: u64,
    pub nchains: u64,
    pub regions: (usize, usize),
    pub times: (usize, usize),
    pub blocks: (usize, usize),
    pub sigs: (usize, usize),
    pub total_len: usize,
}

impl IndexLayout {
    pub fn new(slots: u64, align: u64) -> Self {
        let nchains = prev_prime(slots / 4);
        let align = align.max(8) as usize;
        let mut at = 0usize;
        let mut place = |len: usize| {
            let start = at;
            at = round_up((start + len) as u64, align as u64) as usize;
            (start, len)
        };
        let regions = place(regions::byte_len(slots, nchains));
        let times = place(timeq::byte_len(slots));
        let blocks = place(FblkPlan::new(slots).byte_len());
        let sigs = place(sigs::byte_len(slots, nchains));
        Self {
            slots,
            nchains,
            regions,
            times,
            blocks,
            sigs,
            total_len: at,
        }
    }
}

/// Typed views over one borrowed index segment.
pub(crate) struct Index<B> {
    pub regions: RegionList<B>,
    pub times: TimeQueue<B>,
    pub blocks: Fblk<B>,
    pub sigs: SigIndex<B>,
}

fn carve<'a>(buf: &'a [u8], (start, len): (usize, usize)) -> &'a [u8] {
    &buf[start..start + len]
}

impl<'a> Index<&'a [u8]> {
    pub fn new(buf: &'a [u8], layout: &IndexLayout) -> Self {
        Self {
            regions: RegionList::new(carve(buf, layout.regions)),
            times: TimeQueue::new(carve(buf, layout.times)),
            blocks: Fblk::new(carve(buf, layout.blocks)),
            sigs: SigIndex::new(carve(buf, layout.sigs)),
        }
    }
}

impl<'a> Index<&'a mut [u8]> {
    pub fn new_mut(buf: &'a mut [u8], layout: &IndexLayout) -> Self {
        let (regions, rest) = buf.split_at_mut(layout.times.0);
        let (times, rest) = rest.split_at_mut(layout.blocks.0 - layout.times.0);
        let (blocks, sigs) = rest.split_at_mut(layout.sigs.0 - layout.blocks.0);
        Self {
            regions: RegionList::new(&mut regions[..layout.regions.1]),
            times: TimeQueue::new(&mut times[..layout.times.1]),
            blocks: Fblk::new(&mut blocks[..layout.blocks.1]),
            sigs: SigIndex::new(&mut sigs[..layout.sigs.1]),
        }
    }

    /// Builds empty indexes with one free region spanning the data segment.
    pub fn init(
        &mut self,
        layout: &IndexLayout,
        rng: &mut LevelRng,
        data_offset: u64,
        data_extent: u64,
    ) -> Result<()> {
        self.blocks.init(layout.slots);
        self.times.init(&mut self.blocks, layout.slots)?;
        self.regions
            .init(&mut self.blocks, layout.slots, layout.nchains)?;
        self.regions
            .add(&mut self.blocks, rng, data_offset, data_extent)?;
        self.sigs.init(layout.slots, layout.nchains);
        Ok(())
    }
}

impl<B: AsRef<[u8]>> Index<B> {
    /// Whether every structure carries its magic and the expected capacity.
    pub fn is_valid(&self, layout: &IndexLayout) -> bool {
        self.blocks.is_valid(layout.slots)
            && self.times.is_valid(layout.slots)
            && self.regions.is_valid(layout.slots, layout.nchains)
            && self.sigs.is_valid(layout.slots, layout.nchains)
    }
}
