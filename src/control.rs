//! Control block at file offset 0.
//!
//! Fixed little-endian fields; the block occupies the whole first
//! `data_offset` bytes so it can be locked as one range.

use crate::layout::Geometry;
use crate::slab::{get_i64, get_u32, get_u64, put_i64, put_u32, put_u64};
use crate::timestamp::Timestamp;
use crate::{Error, Result};

pub const PQ_MAGIC: u64 = 0x5051_5545; // 'PQUE'
pub const PQ_VERSION: u64 = 7;
pub(crate) const WRITE_COUNT_MAGIC: u32 = PQ_MAGIC as u32;
pub(crate) const METRICS_MAGIC: u64 = PQ_MAGIC + 1;
pub(crate) const METRICS_MAGIC_2: u64 = PQ_MAGIC + 2;
pub(crate) const MAX_WRITE_COUNT: u32 = u32::MAX;

const MAGIC: usize = 0;
const VERSION: usize = 8;
const DATA_OFFSET: usize = 16;
const INDEX_OFFSET: usize = 24;
const INDEX_SIZE: usize = 32;
const SLOTS: usize = 40;
const ALIGN: usize = 48;
const HIGHWATER: usize = 56;
const MAX_PRODUCTS: usize = 64;
const WRITE_COUNT_MAGIC_AT: usize = 72;
const WRITE_COUNT: usize = 76;
const METRICS_MAGIC_AT: usize = 80;
const MOST_RECENT: usize = 88;
const MVRT: usize = 104;
const IS_FULL: usize = 120;
const METRICS_MAGIC_2_AT: usize = 128;
const MVRT_SIZE: usize = 136;
const MVRT_SLOTS: usize = 144;
pub(crate) const CONTROL_LEN: usize = 152;

/// Minimum virtual residence time and the usage when it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Residence {
    /// Unset as `Timestamp::NONE`.
    pub time: Timestamp,
    /// Bytes in use; -1 when unset.
    pub bytes: i64,
    pub slots: u64,
}

pub(crate) struct Control<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Control<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn word(&self, at: usize) -> u64 {
        get_u64(self.buf.as_ref(), at)
    }

    fn time(&self, at: usize) -> Timestamp {
        Timestamp::new(
            get_i64(self.buf.as_ref(), at),
            get_i64(self.buf.as_ref(), at + 8),
        )
    }

    pub fn magic(&self) -> u64 {
        self.word(MAGIC)
    }

    pub fn version(&self) -> u64 {
        self.word(VERSION)
    }

    pub fn data_offset(&self) -> u64 {
        self.word(DATA_OFFSET)
    }

    pub fn index_offset(&self) -> u64 {
        self.word(INDEX_OFFSET)
    }

    pub fn index_size(&self) -> u64 {
        self.word(INDEX_SIZE)
    }

    pub fn slots(&self) -> u64 {
        self.word(SLOTS)
    }

    pub fn align(&self) -> u64 {
        self.word(ALIGN)
    }

    pub fn highwater(&self) -> u64 {
        self.word(HIGHWATER)
    }

    pub fn max_products(&self) -> u64 {
        self.word(MAX_PRODUCTS)
    }

    pub fn has_write_count(&self) -> bool {
        get_u32(self.buf.as_ref(), WRITE_COUNT_MAGIC_AT) == WRITE_COUNT_MAGIC
    }

    pub fn write_count(&self) -> u32 {
        get_u32(self.buf.as_ref(), WRITE_COUNT)
    }

    pub fn has_metrics(&self) -> bool {
        self.word(METRICS_MAGIC_AT) == METRICS_MAGIC
    }

    pub fn has_metrics_2(&self) -> bool {
        self.word(METRICS_MAGIC_2_AT) == METRICS_MAGIC_2
    }

    pub fn most_recent(&self) -> Timestamp {
        self.time(MOST_RECENT)
    }

    pub fn is_full(&self) -> bool {
        self.word(IS_FULL) != 0
    }

    pub fn residence(&self) -> Residence {
        if !self.has_metrics() {
            return Residence {
                time: Timestamp::NONE,
                bytes: -1,
                slots: 0,
            };
        }
        let (bytes, slots) = if self.has_metrics_2() {
            (get_i64(self.buf.as_ref(), MVRT_SIZE), self.word(MVRT_SLOTS))
        } else {
            (-1, 0)
        };
        Residence {
            time: self.time(MVRT),
            bytes,
            slots,
        }
    }

    /// Validates the header and derives the file geometry from it.
    pub fn geometry(&self, page_size: u64) -> Result<Geometry> {
        if self.magic() != PQ_MAGIC {
            return Err(Error::NotAQueue);
        }
        if self.version() != PQ_VERSION {
            return Err(Error::UnsupportedVersion(self.version()));
        }
        let data_offset = self.data_offset();
        if data_offset == 0 || data_offset % page_size != 0 {
            return Err(Error::Corrupt("data offset not page aligned"));
        }
        if self.index_offset() <= data_offset {
            return Err(Error::Corrupt("index precedes data segment"));
        }
        let geometry = Geometry::with_page(
            page_size,
            self.index_offset() - data_offset,
            self.slots(),
            self.align(),
        )
        .map_err(|_| Error::Corrupt("implausible slot count"))?;
        if geometry.data_offset != data_offset
            || geometry.index_offset != self.index_offset()
            || geometry.index_size != self.index_size()
        {
            return Err(Error::Corrupt("control block geometry mismatch"));
        }
        Ok(geometry)
    }
}

impl Control<&mut [u8]> {
    fn set_word(&mut self, at: usize, value: u64) {
        put_u64(self.buf, at, value);
    }

    fn set_time(&mut self, at: usize, time: Timestamp) {
        put_i64(self.buf, at, time.sec);
        put_i64(self.buf, at + 8, time.usec);
    }

    pub fn init(&mut self, geometry: &Geometry) {
        self.buf[..CONTROL_LEN].fill(0);
        self.set_word(VERSION, PQ_VERSION);
        self.set_word(DATA_OFFSET, geometry.data_offset);
        self.set_word(INDEX_OFFSET, geometry.index_offset);
        self.set_word(INDEX_SIZE, geometry.index_size);
        self.set_word(SLOTS, geometry.slots);
        self.set_word(ALIGN, geometry.align);
        put_u32(self.buf, WRITE_COUNT_MAGIC_AT, WRITE_COUNT_MAGIC);
        self.set_write_count(1);
        self.init_metrics();
        self.init_metrics_2();
        self.set_word(MAGIC, PQ_MAGIC);
    }

    pub fn init_metrics(&mut self) {
        self.set_time(MOST_RECENT, Timestamp::NONE);
        self.set_time(MVRT, Timestamp::NONE);
        self.set_word(IS_FULL, 0);
        self.set_word(METRICS_MAGIC_AT, METRICS_MAGIC);
    }

    pub fn init_metrics_2(&mut self) {
        put_i64(self.buf, MVRT_SIZE, -1);
        self.set_word(MVRT_SLOTS, 0);
        self.set_word(METRICS_MAGIC_2_AT, METRICS_MAGIC_2);
    }

    pub fn init_write_count(&mut self) {
        put_u32(self.buf, WRITE_COUNT_MAGIC_AT, WRITE_COUNT_MAGIC);
        self.set_write_count(0);
    }

    pub fn set_write_count(&mut self, count: u32) {
        put_u32(self.buf, WRITE_COUNT, count);
    }

    pub fn set_highwater(&mut self, value: u64) {
        self.set_word(HIGHWATER, value);
    }

    pub fn set_max_products(&mut self, value: u64) {
        self.set_word(MAX_PRODUCTS, value);
    }

    pub fn set_most_recent(&mut self, time: Timestamp) {
        self.set_time(MOST_RECENT, time);
    }

    pub fn set_full(&mut self, full: bool) {
        self.set_word(IS_FULL, full as u64);
    }

    pub fn set_residence(&mut self, residence: Residence) {
        self.set_time(MVRT, residence.time);
        put_i64(self.buf, MVRT_SIZE, residence.bytes);
        self.set_word(MVRT_SLOTS, residence.slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let geometry = Geometry::with_page(4096, 8192, 16, 8).expect("geometry");
        let mut buf = vec![0u8; 4096];
        Control::new(&mut buf[..]).init(&geometry);
        let ctl = Control::new(&buf[..]);
        assert_eq!(ctl.magic(), PQ_MAGIC);
        assert_eq!(ctl.geometry(4096).expect("geometry"), geometry);
        assert_eq!(ctl.write_count(), 1);
        assert!(ctl.has_write_count());
        assert_eq!(ctl.most_recent(), Timestamp::NONE);
        assert_eq!(ctl.residence().bytes, -1);
    }

    #[test]
    fn foreign_file_is_not_a_queue() {
        let buf = vec![0u8; 4096];
        assert!(matches!(
            Control::new(&buf[..]).geometry(4096),
            Err(Error::NotAQueue)
        ));
    }

    #[test]
    fn tampered_geometry_is_corrupt() {
        let geometry = Geometry::with_page(4096, 8192, 16, 8).expect("geometry");
        let mut buf = vec![0u8; 4096];
        let mut ctl = Control::new(&mut buf[..]);
        ctl.init(&geometry);
        ctl.set_word(INDEX_SIZE, 4096 * 9);
        assert!(matches!(
            Control::new(&buf[..]).geometry(4096),
            Err(Error::Corrupt(_))
        ));
    }
}
