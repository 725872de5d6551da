use std::fmt;
use std::sync::Arc;

use crate::layout::DEFAULT_ALIGN;
use crate::timestamp::{Clock, SystemClock};

/// Open-flag bits, numerically compatible with the classic queue flags.
pub mod flags {
    pub const NOCLOBBER: u32 = 0x01;
    pub const READONLY: u32 = 0x02;
    pub const NOLOCK: u32 = 0x04;
    pub const PRIVATE: u32 = 0x08;
    pub const NOGROW: u32 = 0x10;
    pub const NOMAP: u32 = 0x20;
    pub const MAPRGNS: u32 = 0x40;
    pub const SPARSE: u32 = 0x80;
    pub const THREADSAFE: u32 = 0x100;
}

#[derive(Clone)]
pub struct QueueConfig {
    /// Open without write access; every mutating call fails with `ReadOnly`.
    pub read_only: bool,
    /// Skip advisory record locks. Only safe with a single process.
    pub no_lock: bool,
    /// Map privately; changes never reach the file.
    pub private_map: bool,
    /// Use positioned reads and writes instead of memory mapping.
    pub no_map: bool,
    /// Map each region on access instead of the whole file.
    pub map_regions: bool,
    /// Grow the file by `set_len` (sparse) rather than writing zeros.
    pub sparse: bool,
    /// Fail `create` if the file already exists.
    pub no_clobber: bool,
    /// Send SIGCONT to the process group after each insert.
    pub notify_on_insert: bool,
    /// Source of insertion timestamps.
    pub clock: Arc<dyn Clock>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            no_lock: false,
            private_map: false,
            no_map: false,
            map_regions: false,
            sparse: false,
            no_clobber: false,
            notify_on_insert: true,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("flags", &format_args!("{:#x}", self.flags()))
            .field("notify_on_insert", &self.notify_on_insert)
            .finish_non_exhaustive()
    }
}

impl QueueConfig {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Buffered I/O; works where mapping is unavailable.
    pub fn buffered() -> Self {
        Self {
            no_map: true,
            ..Self::default()
        }
    }

    pub fn region_mapped() -> Self {
        Self {
            map_regions: true,
            ..Self::default()
        }
    }

    pub fn quiet(mut self) -> Self {
        self.notify_on_insert = false;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn flags(&self) -> u32 {
        let mut bits = flags::THREADSAFE;
        for (set, bit) in [
            (self.no_clobber, flags::NOCLOBBER),
            (self.read_only, flags::READONLY),
            (self.no_lock, flags::NOLOCK),
            (self.private_map, flags::PRIVATE),
            (self.no_map, flags::NOMAP),
            (self.map_regions, flags::MAPRGNS),
            (self.sparse, flags::SPARSE),
        ] {
            if set {
                bits |= bit;
            }
        }
        bits
    }

    pub fn from_flags(bits: u32) -> Self {
        Self {
            read_only: bits & flags::READONLY != 0,
            no_lock: bits & flags::NOLOCK != 0,
            private_map: bits & flags::PRIVATE != 0,
            no_map: bits & flags::NOMAP != 0,
            map_regions: bits & flags::MAPRGNS != 0,
            sparse: bits & flags::SPARSE != 0,
            no_clobber: bits & flags::NOCLOBBER != 0,
            ..Self::default()
        }
    }
}

/// Capacity parameters fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    /// Data segment size in bytes; rounded up to `align`.
    pub data_size: u64,
    /// Maximum number of products.
    pub slots: u64,
    /// Region alignment; rounded up to a multiple of 8.
    pub align: u64,
    /// Permission bits of a new file.
    pub mode: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            data_size: 1 << 20,
            slots: 1024,
            align: DEFAULT_ALIGN,
            mode: 0o664,
        }
    }
}

impl CreateOptions {
    pub fn new(data_size: u64, slots: u64) -> Self {
        Self {
            data_size,
            slots,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let config = QueueConfig {
            read_only: true,
            map_regions: true,
            ..QueueConfig::default()
        };
        let bits = config.flags();
        assert_eq!(bits, flags::READONLY | flags::MAPRGNS | flags::THREADSAFE);
        let back = QueueConfig::from_flags(bits);
        assert!(back.read_only && back.map_regions && !back.no_map);
    }
}
