//! Page and alignment arithmetic for the queue file.
//!
//! ```text
//! [ control block ][ data segment ][ index segment ]
//! 0                data_offset     index_offset     total_len
//! ```

use crate::index::IndexLayout;
use crate::{Error, Result};

/// Default alignment of data-product regions.
pub const DEFAULT_ALIGN: u64 = 8;

pub fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}

#[inline]
pub fn round_up(value: u64, unit: u64) -> u64 {
    if unit == 0 {
        return value;
    }
    value.div_ceil(unit) * unit
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

pub fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Largest prime not greater than `n`; 1 when there is none.
pub fn prev_prime(n: u64) -> u64 {
    let mut candidate = n;
    while candidate >= 2 {
        if is_prime(candidate) {
            return candidate;
        }
        candidate -= 1;
    }
    1
}

/// Byte geometry of one queue file. Computed once at create or open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: u64,
    pub align: u64,
    pub slots: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub index_offset: u64,
    pub index_size: u64,
    pub index: IndexLayout,
}

impl Geometry {
    /// Normalises creation parameters: alignment rounds up to a multiple of
    /// 8 and the data size rounds up to the alignment, then to whole pages.
    pub fn new(data_size: u64, slots: u64, align: u64) -> Result<Self> {
        let align = if align == 0 {
            DEFAULT_ALIGN
        } else {
            round_up(align, DEFAULT_ALIGN)
        };
        let data_size = if data_size == 0 {
            align
        } else {
            round_up(data_size, align)
        };
        Self::with_page(page_size(), data_size, slots, align)
    }

    pub(crate) fn with_page(
        page_size: u64,
        data_size: u64,
        slots: u64,
        align: u64,
    ) -> Result<Self> {
        if slots == 0 {
            return Err(Error::Invalid("slot count must be positive"));
        }
        if slots > u32::MAX as u64 / 4 {
            return Err(Error::Invalid("slot count too large"));
        }
        let data_offset = lcm(page_size, align);
        let data_size = round_up(data_size, page_size);
        let index_offset = data_offset
            .checked_add(data_size)
            .ok_or(Error::Invalid("data size overflow"))?;
        let index = IndexLayout::new(slots, align);
        let index_size = round_up(index.total_len as u64, page_size);
        index_offset
            .checked_add(index_size)
            .ok_or(Error::Invalid("queue size overflow"))?;
        Ok(Self {
            page_size,
            align,
            slots,
            data_offset,
            data_size,
            index_offset,
            index_size,
            index,
        })
    }

    pub fn total_len(&self) -> u64 {
        self.index_offset + self.index_size
    }

    /// Extent of the single free region a fresh queue starts with.
    pub fn initial_extent(&self) -> u64 {
        self.index_offset - self.data_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primes() {
        assert_eq!(prev_prime(0), 1);
        assert_eq!(prev_prime(1), 1);
        assert_eq!(prev_prime(2), 2);
        assert_eq!(prev_prime(25), 23);
        assert_eq!(prev_prime(250), 241);
        assert!(is_prime(7919));
        assert!(!is_prime(7917));
    }

    #[test]
    fn geometry_is_page_aligned() {
        let geom = Geometry::with_page(4096, 10_000, 100, 8).expect("geometry");
        assert_eq!(geom.data_offset, 4096);
        assert_eq!(geom.index_offset, 4096 + 12_288);
        assert_eq!(geom.index_size % 4096, 0);
        assert!(geom.index_size as usize >= geom.index.total_len);
        assert_eq!(geom.initial_extent(), 12_288);
    }

    #[test]
    fn alignment_is_normalised() {
        let geom = Geometry::new(1, 4, 12).expect("geometry");
        assert_eq!(geom.align, 16);
        assert_eq!(geom.data_size, geom.page_size);
        assert_eq!(geom.data_offset % geom.page_size, 0);
        assert_eq!(geom.data_offset % 16, 0);
    }

    #[test]
    fn zero_slots_rejected() {
        assert!(matches!(
            Geometry::new(4096, 0, 8),
            Err(Error::Invalid(_))
        ));
    }
}
